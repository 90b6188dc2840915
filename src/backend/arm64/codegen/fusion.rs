//! The instruction fusion engine.
//!
//! One instruction may sit deferred in the pending slot while the next
//! one is examined; when the two match a fused form (multiply-accumulate,
//! shifted-operand ALU, load/store pair, register-offset addressing) a
//! single instruction covers both. A fusion that drops the pending
//! instruction's register write must prove nothing later observes that
//! register. Fusion never fails: an unproven case just emits the pending
//! instruction verbatim.
//!
//! The decision functions are pure and shared between the text emitter
//! and the structured-stream emitter, so the two outputs cannot disagree
//! on what was fused.

use std::io;

use crate::ir::{
    Blk, Cls, Con, Ins, Jmp, Op, PhysReg, Ref, FP_SCRATCH, IP0, IP1, PLATFORM,
};

use super::super::flags::EmitCfg;
use super::emit::Arm64Codegen;
use super::operand_helpers::rname;
use super::select::mem_mnemonic;
use super::FrameLayout;

/// A fused instruction covering the pending and the current one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Fused {
    Madd {
        sub: bool,
        float: bool,
        cls: Cls,
        to: PhysReg,
        a: PhysReg,
        b: PhysReg,
        acc: PhysReg,
    },
    ShiftAlu {
        alu: Op,
        cls: Cls,
        to: PhysReg,
        other: PhysReg,
        src: PhysReg,
        shift: Op,
        amount: i64,
    },
    Pair {
        store: bool,
        cls: Cls,
        lo: PhysReg,
        hi: PhysReg,
        off: i64,
    },
    Indexed {
        op: Op,
        cls: Cls,
        val: PhysReg,
        base: PhysReg,
        index: PhysReg,
    },
}

/// Should `i` be held in the pending slot in the hope of fusing with the
/// next instruction?
pub(crate) fn candidate(cfg: &EmitCfg, cons: &[Con], i: &Ins) -> bool {
    if cfg.ldp_stp && pair_class(i).is_some() {
        return true;
    }
    if cfg.madd && i.op == Op::Mul && i.to.is_reg() && i.arg[0].is_reg() && i.arg[1].is_reg() {
        return true;
    }
    if cfg.shift && shift_const(cons, i).is_some() {
        return true;
    }
    if cfg.indexed && indexed_base(i).is_some() {
        return true;
    }
    if cfg.cbz && cmp_zero(cons, i).is_some() {
        return true;
    }
    false
}

/// The register of a `cmp r, #0`, when `i` is one.
pub(crate) fn cmp_zero(cons: &[Con], i: &Ins) -> Option<PhysReg> {
    if i.op != Op::Cmp || !i.cls.is_int() {
        return None;
    }
    let r = i.arg[0].as_reg()?;
    match i.arg[1] {
        Ref::Con(ix) => match cons[ix as usize] {
            Con::Bits(0) => Some(r),
            _ => None,
        },
        _ => None,
    }
}

fn shift_const(cons: &[Con], i: &Ins) -> Option<i64> {
    if !matches!(i.op, Op::Shl | Op::Shr | Op::Sar) || !i.cls.is_int() {
        return None;
    }
    i.to.as_reg()?;
    i.arg[0].as_reg()?;
    let ix = match i.arg[1] {
        Ref::Con(ix) => ix,
        _ => return None,
    };
    let k = match cons[ix as usize] {
        Con::Bits(k) => k,
        _ => return None,
    };
    let max = if i.cls == Cls::W { 31 } else { 63 };
    (0..=max).contains(&k).then_some(k)
}

fn is_emitter_scratch(r: PhysReg) -> bool {
    r == IP0 || r == IP1 || r == PLATFORM || r == FP_SCRATCH
}

fn indexed_base(i: &Ins) -> Option<(PhysReg, PhysReg, PhysReg)> {
    if i.op != Op::Add || i.cls != Cls::L {
        return None;
    }
    let to = i.to.as_reg()?;
    let base = i.arg[0].as_reg()?;
    let index = i.arg[1].as_reg()?;
    if [to, base, index].into_iter().any(is_emitter_scratch) {
        return None;
    }
    Some((to, base, index))
}

/// Pairing class of a memory instruction: direction, class (which gives
/// size and bank), the value register, and the slot. Only full-width
/// slot-addressed accesses pair.
fn pair_class(i: &Ins) -> Option<(bool, Cls, PhysReg, i32)> {
    let (store, cls, val, addr) = match i.op {
        Op::Load => (false, i.cls, i.to, i.arg[0]),
        Op::StoreW => (true, Cls::W, i.arg[0], i.arg[1]),
        Op::StoreL => (true, Cls::L, i.arg[0], i.arg[1]),
        Op::StoreS => (true, Cls::S, i.arg[0], i.arg[1]),
        Op::StoreD => (true, Cls::D, i.arg[0], i.arg[1]),
        _ => return None,
    };
    let r = val.as_reg()?;
    let s = match addr {
        Ref::Slot(s) => s,
        _ => return None,
    };
    if cls.is_int() != r.is_gpr() {
        return None;
    }
    Some((store, cls, r, s))
}

/// Is it safe to stop writing `prev_to`? Yes when the consuming
/// instruction overwrites it anyway, or when no instruction after it, no
/// terminator argument, and no live-out entry observes it before a
/// redefinition.
fn safe_to_drop(prev_to: PhysReg, cur: &Ins, blk: &Blk, cur_idx: usize) -> bool {
    if cur.to == Ref::Reg(prev_to) {
        return true;
    }
    for i in &blk.ins[cur_idx + 1..] {
        if i.arg[0] == Ref::Reg(prev_to) || i.arg[1] == Ref::Reg(prev_to) {
            return false;
        }
        if i.to == Ref::Reg(prev_to) {
            return true;
        }
    }
    match blk.jmp {
        Jmp::Ret(arg) => {
            if arg == Ref::Reg(prev_to) {
                return false;
            }
        }
        Jmp::Jnz { arg, .. } => {
            if arg == Ref::Reg(prev_to) {
                return false;
            }
        }
        _ => {}
    }
    !blk.out.contains(prev_to)
}

/// Try to cover `p` (pending) and `cur` with one instruction. `idx` is
/// the position of `cur` in the block.
pub(crate) fn try_fuse(
    cfg: &EmitCfg,
    cons: &[Con],
    layout: &FrameLayout,
    blk: &Blk,
    idx: usize,
    p: &Ins,
    cur: &Ins,
) -> Option<Fused> {
    // Pending memory instruction: pairing is the only possibility.
    if cfg.ldp_stp {
        if let Some((st1, k1, r1, s1)) = pair_class(p) {
            let res = (|| {
                let (st2, k2, r2, s2) = pair_class(cur)?;
                if st1 != st2 || k1 != k2 {
                    return None;
                }
                let size = k1.size();
                let (o1, o2) = (layout.slot_off(s1), layout.slot_off(s2));
                let (off, lo, hi) = if o2 == o1 + size {
                    (o1, r1, r2)
                } else if o1 == o2 + size {
                    (o2, r2, r1)
                } else {
                    return None;
                };
                if off % size != 0 || off / size > 63 || off / size < -64 {
                    return None;
                }
                if !st1 && r1 == r2 {
                    return None;
                }
                Some(Fused::Pair {
                    store: st1,
                    cls: k1,
                    lo,
                    hi,
                    off,
                })
            })();
            if cfg.dbg_ldp_stp {
                eprintln!(
                    "ldp/stp: block {} ins {}: {}",
                    blk.id,
                    idx,
                    if res.is_some() { "paired" } else { "not paired" }
                );
            }
            return res;
        }
    }

    // Pending multiply: multiply-accumulate.
    if cfg.madd && p.op == Op::Mul && p.to.is_reg() && p.arg[0].is_reg() && p.arg[1].is_reg() {
        let res = (|| {
            let d0 = p.to.as_reg()?;
            let a = p.arg[0].as_reg()?;
            let b = p.arg[1].as_reg()?;
            if cur.cls != p.cls {
                return None;
            }
            match cur.op {
                Op::Add => {
                    let to = cur.to.as_reg()?;
                    let x = cur.arg[0].as_reg()?;
                    let y = cur.arg[1].as_reg()?;
                    let acc = if x == d0 && y != d0 {
                        y
                    } else if y == d0 && x != d0 {
                        x
                    } else {
                        return None;
                    };
                    if !safe_to_drop(d0, cur, blk, idx) {
                        return None;
                    }
                    Some(Fused::Madd {
                        sub: false,
                        float: !p.cls.is_int(),
                        cls: p.cls,
                        to,
                        a,
                        b,
                        acc,
                    })
                }
                Op::Sub if p.cls.is_int() => {
                    // The product must be the subtrahend, never the
                    // minuend.
                    let to = cur.to.as_reg()?;
                    let minuend = cur.arg[0].as_reg()?;
                    if cur.arg[1] != Ref::Reg(d0) || minuend == d0 {
                        return None;
                    }
                    if !safe_to_drop(d0, cur, blk, idx) {
                        return None;
                    }
                    Some(Fused::Madd {
                        sub: true,
                        float: false,
                        cls: p.cls,
                        to,
                        a,
                        b,
                        acc: minuend,
                    })
                }
                _ => None,
            }
        })();
        if cfg.dbg_madd {
            eprintln!(
                "madd: block {} ins {}: {}",
                blk.id,
                idx,
                if res.is_some() { "fused" } else { "skipped" }
            );
        }
        return res;
    }

    // Pending constant shift: shifted-operand ALU.
    if cfg.shift {
        if let Some(amount) = shift_const(cons, p) {
            let res = (|| {
                if !matches!(cur.op, Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor) {
                    return None;
                }
                if cur.cls != p.cls {
                    return None;
                }
                let d0 = p.to.as_reg()?;
                let src = p.arg[0].as_reg()?;
                let to = cur.to.as_reg()?;
                let x = cur.arg[0].as_reg()?;
                let y = cur.arg[1].as_reg()?;
                let other = if cur.op == Op::Sub {
                    // The shifted register only exists in the trailing
                    // position of sub.
                    if y != d0 || x == d0 {
                        return None;
                    }
                    x
                } else if y == d0 && x != d0 {
                    x
                } else if x == d0 && y != d0 {
                    // Commutative: reorder so the shifted source trails.
                    y
                } else {
                    return None;
                };
                if !safe_to_drop(d0, cur, blk, idx) {
                    return None;
                }
                Some(Fused::ShiftAlu {
                    alu: cur.op,
                    cls: cur.cls,
                    to,
                    other,
                    src,
                    shift: p.op,
                    amount,
                })
            })();
            if cfg.dbg_shift {
                eprintln!(
                    "shift: block {} ins {}: {}",
                    blk.id,
                    idx,
                    if res.is_some() { "fused" } else { "skipped" }
                );
            }
            return res;
        }
    }

    // Pending 64-bit register add: fold into the addressing mode.
    if cfg.indexed {
        if let Some((d0, base, index)) = indexed_base(p) {
            let res = (|| {
                let aix = cur.op.mem_arg()?;
                if cur.arg[aix] != Ref::Reg(d0) {
                    return None;
                }
                let val = if cur.op.is_store() {
                    let v = cur.arg[0].as_reg()?;
                    if v == d0 {
                        return None;
                    }
                    v
                } else {
                    cur.to.as_reg()?
                };
                if !safe_to_drop(d0, cur, blk, idx) {
                    return None;
                }
                Some(Fused::Indexed {
                    op: cur.op,
                    cls: cur.cls,
                    val,
                    base,
                    index,
                })
            })();
            if cfg.dbg_indexed {
                eprintln!(
                    "indexed: block {} ins {}: {}",
                    blk.id,
                    idx,
                    if res.is_some() { "folded" } else { "skipped" }
                );
            }
            return res;
        }
    }

    None
}

impl<'a> Arm64Codegen<'a> {
    /// Process one instruction through the fusion buffer.
    pub(super) fn step_ins(&mut self, blk: &Blk, idx: usize) -> io::Result<()> {
        let cur = blk.ins[idx];
        if let Some(p) = self.pending {
            if let Some(fz) = try_fuse(self.cfg, &self.f.cons, &self.layout, blk, idx, &p, &cur) {
                self.pending = None;
                return self.emit_fused(&fz);
            }
            self.pending = None;
            self.emit_ins(&p)?;
        }
        if candidate(self.cfg, &self.f.cons, &cur) {
            self.pending = Some(cur);
            Ok(())
        } else {
            self.emit_ins(&cur)
        }
    }

    /// Emit whatever is deferred, verbatim.
    pub(super) fn flush_pending(&mut self) -> io::Result<()> {
        match self.pending.take() {
            Some(p) => self.emit_ins(&p),
            None => Ok(()),
        }
    }

    pub(super) fn emit_fused(&mut self, fz: &Fused) -> io::Result<()> {
        match *fz {
            Fused::Madd {
                sub,
                float,
                cls,
                to,
                a,
                b,
                acc,
            } => {
                let m = if float {
                    "fmadd"
                } else if sub {
                    "msub"
                } else {
                    "madd"
                };
                let (to, a, b, acc) =
                    (rname(to, cls), rname(a, cls), rname(b, cls), rname(acc, cls));
                self.emitf(format_args!("    {} {}, {}, {}, {}", m, to, a, b, acc))
            }
            Fused::ShiftAlu {
                alu,
                cls,
                to,
                other,
                src,
                shift,
                amount,
            } => {
                let m = match alu {
                    Op::Add => "add",
                    Op::Sub => "sub",
                    Op::And => "and",
                    Op::Or => "orr",
                    Op::Xor => "eor",
                    _ => unreachable!(),
                };
                let sm = match shift {
                    Op::Shl => "lsl",
                    Op::Shr => "lsr",
                    Op::Sar => "asr",
                    _ => unreachable!(),
                };
                let (to, other, src) = (rname(to, cls), rname(other, cls), rname(src, cls));
                self.emitf(format_args!(
                    "    {} {}, {}, {}, {} #{}",
                    m, to, other, src, sm, amount
                ))
            }
            Fused::Pair {
                store,
                cls,
                lo,
                hi,
                off,
            } => {
                let m = if store { "stp" } else { "ldp" };
                let (lo, hi) = (rname(lo, cls), rname(hi, cls));
                self.emitf(format_args!("    {} {}, {}, [x29, #{}]", m, lo, hi, off))
            }
            Fused::Indexed {
                op,
                cls,
                val,
                base,
                index,
            } => {
                let (m, vk) = mem_mnemonic(op, cls);
                let (val, base, index) =
                    (rname(val, vk), rname(base, Cls::L), rname(index, Cls::L));
                self.emitf(format_args!("    {} {}, [{}, {}]", m, val, base, index))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{one_block, reg};
    use super::*;
    use crate::backend::T_ARM64_ELF;
    use crate::ir::RegSet;

    fn layout_for(slot: u32) -> FrameLayout {
        let f = one_block(vec![], Jmp::Ret(Ref::None), vec![], slot, RegSet::EMPTY);
        FrameLayout::of(&f, &T_ARM64_ELF)
    }

    fn blk(ins: Vec<Ins>, jmp: Jmp, out: RegSet) -> Blk {
        Blk {
            id: 0,
            npred: 1,
            ins,
            jmp,
            out,
        }
    }

    fn fuse(cons: &[Con], b: &Blk, slot: u32) -> Option<Fused> {
        let cfg = EmitCfg::all_fusions();
        let layout = layout_for(slot);
        try_fuse(&cfg, cons, &layout, b, 1, &b.ins[0], &b.ins[1])
    }

    fn mul(to: u8, a: u8, b: u8) -> Ins {
        Ins::new(Op::Mul, Cls::L, reg(to), [reg(a), reg(b)])
    }

    #[test]
    fn madd_decision() {
        let b = blk(
            vec![mul(3, 1, 2), Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)])],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        match fuse(&[], &b, 0) {
            Some(Fused::Madd { sub, float, acc, .. }) => {
                assert!(!sub);
                assert!(!float);
                assert_eq!(acc, PhysReg(5));
            }
            other => panic!("expected a madd, got {:?}", other),
        }
    }

    #[test]
    fn madd_rejects_the_product_as_addend() {
        let b = blk(
            vec![mul(3, 1, 2), Ins::new(Op::Add, Cls::L, reg(4), [reg(3), reg(3)])],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        assert_eq!(fuse(&[], &b, 0), None);
    }

    #[test]
    fn madd_rejects_class_mismatch() {
        let b = blk(
            vec![mul(3, 1, 2), Ins::new(Op::Add, Cls::W, reg(4), [reg(5), reg(3)])],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        assert_eq!(fuse(&[], &b, 0), None);
    }

    #[test]
    fn madd_blocked_by_the_terminator_argument() {
        let b = blk(
            vec![mul(3, 1, 2), Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)])],
            Jmp::Ret(reg(3)),
            RegSet::EMPTY,
        );
        assert_eq!(fuse(&[], &b, 0), None);
    }

    #[test]
    fn madd_allowed_after_a_redefinition() {
        let mut out = RegSet::EMPTY;
        out.insert(PhysReg(3));
        // r3 is redefined before the block end, so the live-out entry
        // refers to the later definition.
        let b = blk(
            vec![
                mul(3, 1, 2),
                Ins::new(Op::Add, Cls::L, reg(4), [reg(5), reg(3)]),
                Ins::new(Op::Copy, Cls::L, reg(3), [reg(6), Ref::None]),
            ],
            Jmp::Ret(Ref::None),
            out,
        );
        assert!(fuse(&[], &b, 0).is_some());
    }

    #[test]
    fn msub_keeps_the_minuend() {
        let b = blk(
            vec![mul(3, 1, 2), Ins::new(Op::Sub, Cls::L, reg(4), [reg(5), reg(3)])],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        match fuse(&[], &b, 0) {
            Some(Fused::Madd { sub: true, acc, .. }) => assert_eq!(acc, PhysReg(5)),
            other => panic!("expected an msub, got {:?}", other),
        }
    }

    #[test]
    fn float_sub_never_fuses() {
        let b = blk(
            vec![
                Ins::new(Op::Mul, Cls::D, reg(35), [reg(33), reg(34)]),
                Ins::new(Op::Sub, Cls::D, reg(36), [reg(37), reg(35)]),
            ],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        assert_eq!(fuse(&[], &b, 0), None);
    }

    #[test]
    fn shift_amount_must_fit_the_class() {
        let cons = [Con::Bits(35)];
        let i = Ins::new(Op::Shl, Cls::W, reg(3), [reg(1), Ref::Con(0)]);
        assert!(!candidate(&EmitCfg::all_fusions(), &cons, &i));
        let i = Ins::new(Op::Shl, Cls::L, reg(3), [reg(1), Ref::Con(0)]);
        assert!(candidate(&EmitCfg::all_fusions(), &cons, &i));
    }

    #[test]
    fn negative_shift_amounts_never_buffer() {
        let cons = [Con::Bits(-1)];
        let i = Ins::new(Op::Shr, Cls::L, reg(3), [reg(1), Ref::Con(0)]);
        assert!(!candidate(&EmitCfg::all_fusions(), &cons, &i));
    }

    #[test]
    fn indexed_base_rejects_scratch_registers() {
        let i = Ins::new(Op::Add, Cls::L, reg(3), [reg(16), reg(2)]);
        assert!(indexed_base(&i).is_none());
        let i = Ins::new(Op::Add, Cls::L, reg(17), [reg(1), reg(2)]);
        assert!(indexed_base(&i).is_none());
        let i = Ins::new(Op::Add, Cls::W, reg(3), [reg(1), reg(2)]);
        assert!(indexed_base(&i).is_none());
    }

    #[test]
    fn pairs_need_matching_class_and_direction() {
        let store_w = Ins::new(Op::StoreW, Cls::W, Ref::None, [reg(0), Ref::Slot(0)]);
        let store_l = Ins::new(Op::StoreL, Cls::W, Ref::None, [reg(1), Ref::Slot(1)]);
        let load_w = Ins::new(Op::Load, Cls::W, reg(1), [Ref::Slot(1), Ref::None]);
        let b = blk(vec![store_w, store_l], Jmp::Ret(Ref::None), RegSet::EMPTY);
        assert_eq!(fuse(&[], &b, 8), None);
        let b = blk(vec![store_w, load_w], Jmp::Ret(Ref::None), RegSet::EMPTY);
        assert_eq!(fuse(&[], &b, 8), None);
    }

    #[test]
    fn load_pairs_need_distinct_destinations() {
        let b = blk(
            vec![
                Ins::new(Op::Load, Cls::L, reg(2), [Ref::Slot(0), Ref::None]),
                Ins::new(Op::Load, Cls::L, reg(2), [Ref::Slot(2), Ref::None]),
            ],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        assert_eq!(fuse(&[], &b, 4), None);
    }

    #[test]
    fn float_pairs_use_the_vector_bank() {
        let b = blk(
            vec![
                Ins::new(Op::StoreD, Cls::W, Ref::None, [reg(33), Ref::Slot(0)]),
                Ins::new(Op::StoreD, Cls::W, Ref::None, [reg(34), Ref::Slot(2)]),
            ],
            Jmp::Ret(Ref::None),
            RegSet::EMPTY,
        );
        match fuse(&[], &b, 4) {
            Some(Fused::Pair { store: true, cls: Cls::D, lo, hi, off }) => {
                assert_eq!((lo, hi), (PhysReg(33), PhysReg(34)));
                assert_eq!(off, 16);
            }
            other => panic!("expected a store pair, got {:?}", other),
        }
    }

    #[test]
    fn kill_switches_disable_buffering() {
        let cfg = EmitCfg::no_fusions();
        let cons = [Con::Bits(0), Con::Bits(3)];
        for i in [
            mul(3, 1, 2),
            Ins::new(Op::Shl, Cls::L, reg(3), [reg(1), Ref::Con(1)]),
            Ins::new(Op::StoreW, Cls::W, Ref::None, [reg(0), Ref::Slot(0)]),
            Ins::new(Op::Add, Cls::L, reg(3), [reg(1), reg(2)]),
            Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), Ref::Con(0)]),
        ] {
            assert!(!candidate(&cfg, &cons, &i));
        }
    }

    #[test]
    fn cmp_zero_detection() {
        let cons = [Con::Bits(0), Con::Bits(1)];
        let i = Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), Ref::Con(0)]);
        assert_eq!(cmp_zero(&cons, &i), Some(PhysReg(1)));
        let i = Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), Ref::Con(1)]);
        assert_eq!(cmp_zero(&cons, &i), None);
        let i = Ins::new(Op::Cmp, Cls::W, Ref::None, [reg(1), reg(2)]);
        assert_eq!(cmp_zero(&cons, &i), None);
    }
}
