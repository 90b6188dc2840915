//! Emission context and the function walk.
//!
//! Blocks are visited in layout order; instructions flow through the
//! one-slot fusion buffer; terminators handle the fall-through and
//! successor-swap rules. The text for one instruction is always written
//! as a whole line, so a sink failure can only lose a line suffix.

use std::fmt;
use std::io;

use log::debug;

use crate::backend::{EmitResult, Target};
use crate::ir::{Blk, BlkId, Cond, Func, Ins, Jmp};

use super::super::flags::EmitCfg;
use super::operand_helpers::rname;
use super::FrameLayout;

/// One emission context: a function, a target, the computed frame, and
/// the fusion buffer.
pub struct Arm64Codegen<'a> {
    pub(super) f: &'a Func,
    pub(super) target: &'a Target,
    pub(super) cfg: &'a EmitCfg,
    pub(super) out: &'a mut dyn io::Write,
    pub(super) layout: FrameLayout,
    pub(super) pending: Option<Ins>,
    pub(super) label_base: u32,
}

/// A compilation unit. Local label ids are unique and monotonically
/// increasing across every function emitted through the same unit.
#[derive(Default)]
pub struct Unit {
    next_label: u32,
}

impl Unit {
    pub fn new() -> Unit {
        Unit::default()
    }

    pub fn emit(
        &mut self,
        f: &Func,
        target: &Target,
        cfg: &EmitCfg,
        out: &mut dyn io::Write,
    ) -> EmitResult<()> {
        f.validate()?;
        let layout = FrameLayout::of(f, target);
        debug!(
            "emitting {} ({} blocks, frame {}, padding {})",
            f.name,
            f.blks.len(),
            layout.frame,
            layout.padding
        );
        let label_base = self.next_label;
        self.next_label += f.blks.len() as u32;
        let mut cg = Arm64Codegen {
            f,
            target,
            cfg,
            out,
            layout,
            pending: None,
            label_base,
        };
        cg.emit_fn()?;
        Ok(())
    }
}

/// Emit one function into a fresh unit.
pub fn emit_function(
    f: &Func,
    target: &Target,
    cfg: &EmitCfg,
    out: &mut dyn io::Write,
) -> EmitResult<()> {
    Unit::new().emit(f, target, cfg, out)
}

impl<'a> Arm64Codegen<'a> {
    /// Write one line, appending the newline. Instruction lines carry
    /// their own indentation.
    pub(super) fn emitf(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.out.write_fmt(args)?;
        self.out.write_all(b"\n")
    }

    pub(super) fn label(&self, id: BlkId) -> String {
        format!("{}{}", self.target.asloc, self.label_base + id)
    }

    fn emit_fn(&mut self) -> io::Result<()> {
        let (f, target) = (self.f, self.target);
        target.emit_fn_header(&f.name, &f.lnk, &mut *self.out)?;
        self.emitf(format_args!("    hint #34"))?;
        self.emit_prologue()?;

        let mut fell = true;
        for pos in 0..f.rpo.len() {
            let blk = f.blk(f.rpo[pos]);
            let next = f.rpo.get(pos + 1).copied();
            if !fell || blk.npred > 1 {
                let l = self.label(blk.id);
                self.emitf(format_args!("{}:", l))?;
            }
            for idx in 0..blk.ins.len() {
                self.step_ins(blk, idx)?;
            }
            fell = self.emit_jmp(blk, next)?;
        }

        target.emit_fn_footer(&f.name, &mut *self.out)
    }

    /// Emit a block terminator. Returns whether execution falls through
    /// into the next laid-out block.
    fn emit_jmp(&mut self, blk: &Blk, next: Option<BlkId>) -> io::Result<bool> {
        match blk.jmp {
            Jmp::Halt => {
                self.flush_pending()?;
                self.emitf(format_args!("    brk #1000"))?;
                Ok(false)
            }
            Jmp::Ret(_) => {
                self.flush_pending()?;
                self.emit_epilogue()?;
                Ok(false)
            }
            Jmp::Jmp(s1) => {
                self.flush_pending()?;
                self.emit_goto(s1, next)
            }
            Jmp::Jnz { cond, s1, s2, .. } => {
                // When the next laid-out block is the false successor the
                // branch condition is kept and aimed at s1; otherwise the
                // condition is negated and aimed at s2, and the
                // unconditional tail goes to s1.
                let (bc, btarget, jtarget) = if next == Some(s2) {
                    (cond, s1, s2)
                } else {
                    (cond.negate(), s2, s1)
                };
                if let Some(p) = self.pending {
                    if let Some(r) = super::fusion::cmp_zero(&self.f.cons, &p) {
                        if bc == Cond::Eq || bc == Cond::Ne {
                            self.pending = None;
                            let m = if bc == Cond::Eq { "cbz" } else { "cbnz" };
                            let reg = rname(r, p.cls);
                            let l = self.label(btarget);
                            self.emitf(format_args!("    {} {}, {}", m, reg, l))?;
                            return self.emit_goto(jtarget, next);
                        }
                    }
                }
                self.flush_pending()?;
                let l = self.label(btarget);
                self.emitf(format_args!("    b.{} {}", bc.mnemonic(), l))?;
                self.emit_goto(jtarget, next)
            }
        }
    }

    /// Unconditional jump, elided when the target is the next laid-out
    /// block.
    fn emit_goto(&mut self, target: BlkId, next: Option<BlkId>) -> io::Result<bool> {
        if next == Some(target) {
            Ok(true)
        } else {
            let l = self.label(target);
            self.emitf(format_args!("    b {}", l))?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{emit_text, func, lines, one_block, reg};
    use super::*;
    use crate::backend::arm64::flags::EmitCfg;
    use crate::backend::{T_ARM64_APPLE, T_ARM64_ELF};
    use crate::ir::{Cls, Con, Op, PhysReg, Ref, RegSet};

    fn ret() -> Jmp {
        Jmp::Ret(Ref::None)
    }

    #[test]
    fn simple_return() {
        // copy w0 <- 42, return: minimal frame with a paired push/pop.
        let f = one_block(
            vec![Ins::new(Op::Copy, Cls::W, reg(0), [Ref::Con(0), Ref::None])],
            ret(),
            vec![Con::Bits(42)],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert_eq!(
            lines(&text),
            vec![
                ".text",
                "f:",
                "hint #34",
                "stp x29, x30, [sp, -16]!",
                "mov x29, sp",
                "mov w0, #42",
                "ldp x29, x30, [sp], 16",
                "ret",
                ".type f, @function",
                ".size f, .-f",
            ]
        );
    }

    #[test]
    fn apple_output_prefixes_and_drops_the_footer() {
        let f = one_block(vec![], ret(), vec![], 0, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_APPLE, &EmitCfg::all_fusions());
        assert!(text.contains("_f:"));
        assert!(!text.contains(".size"));
        assert!(!text.contains(".type"));
    }

    #[test]
    fn madd_fusion_replaces_mul_add() {
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)]),
            ],
            ret(),
            vec![],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("madd x4, x1, x2, x5"));
        assert!(!text.contains("mul x3"));

        let plain = emit_text(&f, &T_ARM64_ELF, &EmitCfg::no_fusions());
        assert!(plain.contains("mul x3, x1, x2"));
        assert!(plain.contains("add x4, x5, x3"));
        assert!(!plain.contains("madd"));
    }

    #[test]
    fn madd_blocked_by_live_out() {
        let mut out = RegSet::EMPTY;
        out.insert(PhysReg(3));
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)]),
            ],
            ret(),
            vec![],
            0,
            out,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("mul x3, x1, x2"));
        assert!(!text.contains("madd"));
    }

    #[test]
    fn madd_blocked_by_later_use() {
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)]),
                Ins::new(Op::Add, Cls::L, reg(6), [reg(3), reg(3)]),
            ],
            ret(),
            vec![],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("mul x3, x1, x2"));
    }

    #[test]
    fn madd_allowed_when_consumer_overwrites_the_product() {
        let mut out = RegSet::EMPTY;
        out.insert(PhysReg(3));
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Add, Cls::L, reg(3), [reg(5), reg(3)]),
            ],
            ret(),
            vec![],
            0,
            out,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("madd x3, x1, x2, x5"));
    }

    #[test]
    fn msub_requires_the_product_in_second_position() {
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::W, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Sub, Cls::W, reg(4), [reg(5), reg(3)]),
            ],
            ret(),
            vec![],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("msub w4, w1, w2, w5"));

        let swapped = one_block(
            vec![
                Ins::new(Op::Mul, Cls::W, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Sub, Cls::W, reg(4), [reg(3), reg(5)]),
            ],
            ret(),
            vec![],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&swapped, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(!text.contains("msub"));
        assert!(text.contains("mul w3, w1, w2"));
    }

    #[test]
    fn fmadd_fuses_float_multiplies() {
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::D, reg(35), [reg(33), reg(34)]),
                Ins::new(Op::Add, Cls::D, reg(36), [reg(37), reg(35)]),
            ],
            ret(),
            vec![],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("fmadd d4, d1, d2, d5"));
    }

    #[test]
    fn shift_fusion_produces_shifted_operands() {
        let f = one_block(
            vec![
                Ins::new(Op::Shl, Cls::L, reg(3), [reg(1), Ref::Con(0)]),
                Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)]),
            ],
            ret(),
            vec![Con::Bits(3)],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("add x4, x5, x1, lsl #3"));
    }

    #[test]
    fn shift_fusion_reorders_commutative_operands() {
        let f = one_block(
            vec![
                Ins::new(Op::Sar, Cls::L, reg(3), [reg(1), Ref::Con(0)]),
                Ins::new(Op::Xor, Cls::L, reg(4), [reg(3), reg(5)]),
            ],
            ret(),
            vec![Con::Bits(63)],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("eor x4, x5, x1, asr #63"));
    }

    #[test]
    fn sub_never_takes_the_shift_on_the_left() {
        let f = one_block(
            vec![
                Ins::new(Op::Shl, Cls::L, reg(3), [reg(1), Ref::Con(0)]),
                Ins::new(Op::Sub, Cls::L, reg(4), [reg(3), reg(5)]),
            ],
            ret(),
            vec![Con::Bits(2)],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("lsl x3, x1, #2"));
        assert!(text.contains("sub x4, x3, x5"));
    }

    #[test]
    fn adjacent_word_stores_pair() {
        let f = one_block(
            vec![
                Ins::new(Op::StoreW, Cls::W, Ref::None, [reg(0), Ref::Slot(0)]),
                Ins::new(Op::StoreW, Cls::W, Ref::None, [reg(1), Ref::Slot(1)]),
            ],
            ret(),
            vec![],
            4,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("stp w0, w1, [x29, #16]"));
        assert!(!text.contains("str w0"));
    }

    #[test]
    fn non_adjacent_stores_do_not_pair() {
        let f = one_block(
            vec![
                Ins::new(Op::StoreW, Cls::W, Ref::None, [reg(0), Ref::Slot(0)]),
                Ins::new(Op::StoreW, Cls::W, Ref::None, [reg(1), Ref::Slot(2)]),
            ],
            ret(),
            vec![],
            4,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("str w0, [x29, #16]"));
        assert!(text.contains("str w1, [x29, #24]"));
        assert!(!text.contains("stp w"));
    }

    #[test]
    fn descending_loads_pair_with_register_order_matching_offsets() {
        let f = one_block(
            vec![
                Ins::new(Op::Load, Cls::L, reg(2), [Ref::Slot(2), Ref::None]),
                Ins::new(Op::Load, Cls::L, reg(3), [Ref::Slot(0), Ref::None]),
            ],
            ret(),
            vec![],
            4,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("ldp x3, x2, [x29, #16]"));
    }

    #[test]
    fn pair_offset_boundary_at_504() {
        // 8-byte pairs reach offset 504 but not 512.
        let ok = one_block(
            vec![
                Ins::new(Op::Load, Cls::L, reg(2), [Ref::Slot(122), Ref::None]),
                Ins::new(Op::Load, Cls::L, reg(3), [Ref::Slot(124), Ref::None]),
            ],
            ret(),
            vec![],
            128,
            RegSet::EMPTY,
        );
        let text = emit_text(&ok, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("ldp x2, x3, [x29, #504]"));

        let far = one_block(
            vec![
                Ins::new(Op::Load, Cls::L, reg(2), [Ref::Slot(124), Ref::None]),
                Ins::new(Op::Load, Cls::L, reg(3), [Ref::Slot(126), Ref::None]),
            ],
            ret(),
            vec![],
            128,
            RegSet::EMPTY,
        );
        let text = emit_text(&far, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(!text.contains("ldp x2"));
        assert!(text.contains("ldr x2, [x29, #512]"));
    }

    #[test]
    fn cbz_fusion_drops_the_compare() {
        let f = func(
            vec![
                (
                    vec![Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), Ref::Con(0)])],
                    Jmp::Jnz {
                        cond: Cond::Eq,
                        arg: Ref::None,
                        s1: 2,
                        s2: 1,
                    },
                    RegSet::EMPTY,
                ),
                (vec![], Jmp::Jmp(2), RegSet::EMPTY),
                (vec![], Jmp::Ret(Ref::None), RegSet::EMPTY),
            ],
            vec![Con::Bits(0)],
            0,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("cbz w1, .L2"));
        assert!(!text.contains("cmp"));

        let plain = emit_text(&f, &T_ARM64_ELF, &EmitCfg::no_fusions());
        assert!(plain.contains("cmp w1, #0"));
        assert!(plain.contains("b.eq .L2"));
    }

    #[test]
    fn conditional_branch_negates_when_true_successor_is_next() {
        let f = func(
            vec![
                (
                    vec![Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), reg(2)])],
                    Jmp::Jnz {
                        cond: Cond::Lt,
                        arg: Ref::None,
                        s1: 1,
                        s2: 2,
                    },
                    RegSet::EMPTY,
                ),
                (vec![], Jmp::Jmp(2), RegSet::EMPTY),
                (vec![], Jmp::Ret(Ref::None), RegSet::EMPTY),
            ],
            vec![],
            0,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        // s1 is the next block: branch on the negated condition to s2.
        assert!(text.contains("b.ge .L2"));
    }

    #[test]
    fn large_frame_goes_through_x16() {
        // 2044 slots: frame + 16 = 8192.
        let f = one_block(vec![], ret(), vec![], 2044, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        let l = lines(&text);
        let pro: Vec<&str> = l.iter().skip_while(|s| **s != "hint #34").copied().collect();
        assert_eq!(pro[1], "mov x16, #8192");
        assert_eq!(pro[2], "sub sp, sp, x16");
        assert_eq!(pro[3], "stp x29, x30, [sp, -16]!");
        assert_eq!(pro[4], "mov x29, sp");
        assert!(text.contains("ldp x29, x30, [sp], 16"));
        assert!(text.contains("add sp, sp, x16"));
    }

    #[test]
    fn frame_case_boundaries() {
        // frame+16 = 496: single pre-indexed push.
        let f = one_block(vec![], ret(), vec![], 120, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("stp x29, x30, [sp, -496]!"));
        assert!(text.contains("ldp x29, x30, [sp], 496"));

        // frame+16 = 512: sub with an immediate.
        let f = one_block(vec![], ret(), vec![], 124, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("sub sp, sp, #512"));
        assert!(text.contains("stp x29, x30, [sp, -16]!"));

        // frame+16 = 4048: still the immediate form.
        let f = one_block(vec![], ret(), vec![], 1008, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("sub sp, sp, #4048"));

        // frame+16 = 4112: one mov through x16.
        let f = one_block(vec![], ret(), vec![], 1024, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("mov x16, #4112"));

        // frame+16 = 65552: mov plus movk.
        let f = one_block(vec![], ret(), vec![], 16384, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("mov x16, #16"));
        assert!(text.contains("movk x16, #0x1, lsl #16"));
    }

    #[test]
    fn indexed_load_folds_the_address_add() {
        let f = one_block(
            vec![
                Ins::new(Op::Add, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Load, Cls::L, reg(4), [reg(3), Ref::None]),
            ],
            ret(),
            vec![],
            0,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("ldr x4, [x1, x2]"));
        assert!(!text.contains("add x3"));
    }

    #[test]
    fn indexed_fold_blocked_when_address_is_live_out() {
        let mut out = RegSet::EMPTY;
        out.insert(PhysReg(3));
        let f = one_block(
            vec![
                Ins::new(Op::Add, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Load, Cls::L, reg(4), [reg(3), Ref::None]),
            ],
            ret(),
            vec![],
            0,
            out,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("add x3, x1, x2"));
        assert!(text.contains("ldr x4, [x3]"));
    }

    #[test]
    fn callee_saves_pair_and_restore_mirrors() {
        let regs: RegSet = [PhysReg(19), PhysReg(20), PhysReg(21)].into_iter().collect();
        let mut f = one_block(vec![], ret(), vec![], 0, RegSet::EMPTY);
        f.reg = regs;
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("stp x19, x20, [x29, #16]"));
        assert!(text.contains("str x21, [x29, #32]"));
        assert!(text.contains("ldp x19, x20, [x29, #16]"));
        assert!(text.contains("ldr x21, [x29, #32]"));
    }

    #[test]
    fn vararg_function_saves_the_register_arguments() {
        let mut f = one_block(vec![], ret(), vec![], 0, RegSet::EMPTY);
        f.vararg = true;
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("stp x29, x30, [sp, -208]!"));
        assert!(text.contains("str x0, [x29, #16]"));
        assert!(text.contains("str x7, [x29, #72]"));
        assert!(text.contains("str q0, [x29, #80]"));
        assert!(text.contains("str q7, [x29, #192]"));

        let apple = emit_text(&f, &T_ARM64_APPLE, &EmitCfg::all_fusions());
        assert!(!apple.contains("str q0"));
    }

    #[test]
    fn dynalloc_return_resets_sp_from_fp() {
        let mut f = one_block(
            vec![Ins::new(Op::SAlloc, Cls::L, reg(0), [Ref::Con(0), Ref::None])],
            ret(),
            vec![Con::Bits(32)],
            0,
            RegSet::EMPTY,
        );
        f.dynalloc = true;
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("sub sp, sp, #32"));
        assert!(text.contains("mov x0, sp"));
        assert!(text.contains("mov sp, x29"));
    }

    #[test]
    fn halt_is_a_trap() {
        let f = one_block(vec![], Jmp::Halt, vec![], 0, RegSet::EMPTY);
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("brk #1000"));
    }

    #[test]
    fn fallthrough_jump_is_elided_and_labels_appear_on_join_points() {
        let f = func(
            vec![
                (
                    vec![Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), reg(2)])],
                    Jmp::Jnz {
                        cond: Cond::Eq,
                        arg: Ref::None,
                        s1: 2,
                        s2: 1,
                    },
                    RegSet::EMPTY,
                ),
                (vec![], Jmp::Jmp(2), RegSet::EMPTY),
                (vec![], Jmp::Ret(Ref::None), RegSet::EMPTY),
            ],
            vec![],
            0,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        // Block 1 follows by fall-through and has one predecessor: no
        // label; block 2 is a join point and gets one.
        assert!(!text.contains(".L1:"));
        assert!(text.contains(".L2:"));
        assert!(!text.contains("b .L2"));
    }

    #[test]
    fn emission_is_deterministic() {
        let f = one_block(
            vec![
                Ins::new(Op::Mul, Cls::L, reg(3), [reg(1), reg(2)]),
                Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)]),
            ],
            ret(),
            vec![],
            8,
            RegSet::EMPTY,
        );
        let a = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        let b = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert_eq!(a, b);
    }

    #[test]
    fn unit_labels_stay_unique_across_functions() {
        let f = func(
            vec![
                (
                    vec![Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), reg(2)])],
                    Jmp::Jnz {
                        cond: Cond::Eq,
                        arg: Ref::None,
                        s1: 1,
                        s2: 1,
                    },
                    RegSet::EMPTY,
                ),
                (vec![], Jmp::Ret(Ref::None), RegSet::EMPTY),
            ],
            vec![],
            0,
        );
        let mut unit = Unit::new();
        let mut out = Vec::new();
        unit.emit(&f, &T_ARM64_ELF, &EmitCfg::all_fusions(), &mut out)
            .unwrap();
        unit.emit(&f, &T_ARM64_ELF, &EmitCfg::all_fusions(), &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        // The second emission reserves fresh ids: .L1 once, .L3 once.
        assert_eq!(text.matches(".L1:").count(), 1);
        assert_eq!(text.matches(".L3:").count(), 1);
    }

    #[test]
    fn far_slot_store_goes_through_a_scratch() {
        // Slot offset beyond the 4-byte scaled range (4 * 4095).
        let f = one_block(
            vec![Ins::new(
                Op::StoreW,
                Cls::W,
                Ref::None,
                [reg(0), Ref::Slot(4100)],
            )],
            ret(),
            vec![],
            4104,
            RegSet::EMPTY,
        );
        let text = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(text.contains("mov x16, #16416"));
        assert!(text.contains("add x16, x29, x16"));
        assert!(text.contains("str w0, [x16]"));
    }

    #[test]
    fn apple_constant_store_to_far_slot_reroutes_through_v31() {
        let f = one_block(
            vec![Ins::new(
                Op::StoreW,
                Cls::W,
                Ref::None,
                [Ref::Con(0), Ref::Slot(4100)],
            )],
            ret(),
            vec![Con::Bits(7)],
            4104,
            RegSet::EMPTY,
        );
        let apple = emit_text(&f, &T_ARM64_APPLE, &EmitCfg::all_fusions());
        assert!(apple.contains("mov w16, #7"));
        assert!(apple.contains("fmov s31, w16"));
        assert!(apple.contains("str s31, [x16]"));

        // ELF has a second scratch and keeps the integer store.
        let elf = emit_text(&f, &T_ARM64_ELF, &EmitCfg::all_fusions());
        assert!(elf.contains("mov w16, #7"));
        assert!(elf.contains("add x18, x29, x18"));
        assert!(elf.contains("str w16, [x18]"));
    }
}
