//! Frame layout, prologue, and epilogue.
//!
//! The frame holds, from high to low addresses: the vararg save area
//! (ELF vararg functions only), callee-save slots, spill/local slots,
//! rounding padding, and the saved FP/LR pair the frame pointer points
//! at. Slot counts are rounded to four so the frame stays 16-aligned,
//! and the callee-save count is rounded to even for the same reason.

use std::io;

use crate::backend::Target;
use crate::ir::{Cls, Func, PhysReg};

use super::emit::Arm64Codegen;
use super::operand_helpers::rname;

/// The computed frame parameters of one function.
#[derive(Debug, Clone)]
pub(crate) struct FrameLayout {
    /// Total frame bytes above the saved FP/LR pair.
    pub frame: i64,
    /// Rounding waste between the saved pair and the first local.
    pub padding: i64,
    /// Bytes of the (rounded) slot region.
    pub slots4: i64,
    /// FP-relative offset of the vararg save area, when present.
    pub vararg_off: Option<i64>,
    /// Callee saves with their FP-relative offsets, in save order.
    pub saves: Vec<(PhysReg, i64)>,
}

impl FrameLayout {
    pub fn of(f: &Func, t: &Target) -> FrameLayout {
        let slot = f.slot as i64;
        let f4 = (slot + 3) & !3;
        let save_regs: Vec<PhysReg> = t
            .calleesave
            .iter()
            .copied()
            .filter(|&r| f.reg.contains(r))
            .collect();
        let o = (save_regs.len() as i64 + 1) & !1;
        let mut frame = 4 * f4 + 8 * o;
        let padding = 4 * (f4 - slot);
        let saves = save_regs
            .into_iter()
            .enumerate()
            .map(|(i, r)| (r, 16 + 4 * f4 + 8 * i as i64))
            .collect();
        let vararg_off = if f.vararg && !t.apple {
            let off = 16 + frame;
            frame += 192;
            Some(off)
        } else {
            None
        };
        FrameLayout {
            frame,
            padding,
            slots4: 4 * f4,
            vararg_off,
            saves,
        }
    }

    /// FP-relative byte offset of a stack slot. Locals grow up from the
    /// padding; spills grow down from the top of the slot region.
    pub fn slot_off(&self, s: i32) -> i64 {
        if s >= 0 {
            16 + self.padding + 4 * s as i64
        } else {
            16 + self.slots4 + 4 * s as i64
        }
    }
}

impl<'a> Arm64Codegen<'a> {
    pub(super) fn emit_prologue(&mut self) -> io::Result<()> {
        let n = self.layout.frame + 16;
        if n <= 504 {
            self.emitf(format_args!("    stp x29, x30, [sp, -{}]!", n))?;
        } else if n <= 4095 {
            self.emitf(format_args!("    sub sp, sp, #{}", n))?;
            self.emitf(format_args!("    stp x29, x30, [sp, -16]!"))?;
        } else if n <= 65535 {
            self.emitf(format_args!("    mov x16, #{}", n))?;
            self.emitf(format_args!("    sub sp, sp, x16"))?;
            self.emitf(format_args!("    stp x29, x30, [sp, -16]!"))?;
        } else {
            self.emitf(format_args!("    mov x16, #{}", n & 0xffff))?;
            self.emitf(format_args!("    movk x16, #{:#x}, lsl #16", n >> 16))?;
            self.emitf(format_args!("    sub sp, sp, x16"))?;
            self.emitf(format_args!("    stp x29, x30, [sp, -16]!"))?;
        }
        self.emitf(format_args!("    mov x29, sp"))?;
        self.emit_saves(false)?;
        if let Some(base) = self.layout.vararg_off {
            for i in 0..8 {
                self.emitf(format_args!("    str x{}, [x29, #{}]", i, base + 8 * i))?;
            }
            for i in 0..8 {
                self.emitf(format_args!("    str q{}, [x29, #{}]", i, base + 64 + 16 * i))?;
            }
        }
        Ok(())
    }

    /// Restore callee saves, undo any dynamic allocation, tear the frame
    /// down, and return.
    pub(super) fn emit_epilogue(&mut self) -> io::Result<()> {
        self.emit_saves(true)?;
        if self.f.dynalloc {
            self.emitf(format_args!("    mov sp, x29"))?;
        }
        let n = self.layout.frame + 16;
        if n <= 504 {
            self.emitf(format_args!("    ldp x29, x30, [sp], {}", n))?;
        } else {
            self.emitf(format_args!("    ldp x29, x30, [sp], 16"))?;
            if n <= 4095 {
                self.emitf(format_args!("    add sp, sp, #{}", n))?;
            } else if n <= 65535 {
                self.emitf(format_args!("    mov x16, #{}", n))?;
                self.emitf(format_args!("    add sp, sp, x16"))?;
            } else {
                self.emitf(format_args!("    mov x16, #{}", n & 0xffff))?;
                self.emitf(format_args!("    movk x16, #{:#x}, lsl #16", n >> 16))?;
                self.emitf(format_args!("    add sp, sp, x16"))?;
            }
        }
        self.emitf(format_args!("    ret"))
    }

    /// Save or restore the callee-save registers, pairing adjacent
    /// same-bank entries whose low offset fits the scaled 7-bit field.
    fn emit_saves(&mut self, restore: bool) -> io::Result<()> {
        let saves = self.layout.saves.clone();
        let mut i = 0;
        while i < saves.len() {
            let (r1, o1) = saves[i];
            let k = if r1.is_vec() { Cls::D } else { Cls::L };
            if i + 1 < saves.len() {
                let (r2, o2) = saves[i + 1];
                if r1.is_vec() == r2.is_vec() && o2 == o1 + 8 && o1 <= 504 {
                    let m = if restore { "ldp" } else { "stp" };
                    let (n1, n2) = (rname(r1, k), rname(r2, k));
                    self.emitf(format_args!("    {} {}, {}, [x29, #{}]", m, n1, n2, o1))?;
                    i += 2;
                    continue;
                }
            }
            let m = if restore { "ldr" } else { "str" };
            let n1 = rname(r1, k);
            self.emitf(format_args!("    {} {}, [x29, #{}]", m, n1, o1))?;
            i += 1;
        }
        Ok(())
    }
}
