//! 128-bit vector emission.
//!
//! The vector opcodes work on the fixed scratch registers V28 and V29,
//! with V30 as the third operand of the fused multiply-add and V31 as
//! the reduction staging register. The arrangement rides in the first
//! argument. Integer and float arrangements share opcodes and split at
//! the mnemonic; the ISA has no integer vector divide and no 64-bit
//! integer vector multiply.

use std::io;

use crate::ir::{Cls, Con, Ins, Op, Ref, VArr};

use super::emit::Arm64Codegen;
use super::operand_helpers::rname;

impl<'a> Arm64Codegen<'a> {
    fn varr(&self, i: &Ins) -> VArr {
        let ix = match i.arg[0] {
            Ref::Con(ix) => ix,
            r => panic!("vector op {:?} without an arrangement, got {:?}", i.op, r),
        };
        let bits = match self.f.cons[ix as usize] {
            Con::Bits(b) => b,
            _ => panic!("vector arrangement must be a bit constant"),
        };
        VArr::from_bits(bits)
            .unwrap_or_else(|| panic!("bad vector arrangement {} for {:?}", bits, i.op))
    }

    /// A whole-register vector load or store.
    fn vector_mem(&mut self, m: &str, vr: &str, addr: Ref) -> io::Result<()> {
        match addr {
            Ref::Reg(r) => {
                let rn = rname(r, Cls::L);
                self.emitf(format_args!("    {} {}, [{}]", m, vr, rn))
            }
            Ref::Slot(s) => {
                let off = self.layout.slot_off(s);
                if off % 16 == 0 && off <= 16 * 4095 {
                    self.emitf(format_args!("    {} {}, [x29, #{}]", m, vr, off))
                } else {
                    let scr = self.target.fixup_scratch[0];
                    self.addr_into(scr, off)?;
                    let rn = rname(scr, Cls::L);
                    self.emitf(format_args!("    {} {}, [{}]", m, vr, rn))
                }
            }
            r => panic!("bad vector address {:?}", r),
        }
    }

    pub(super) fn emit_vector(&mut self, i: &Ins) -> io::Result<()> {
        let arr = self.varr(i);
        let a = arr.spec();
        match i.op {
            Op::VLoadA => self.vector_mem("ldr", "q28", i.arg[1]),
            Op::VLoadB => self.vector_mem("ldr", "q29", i.arg[1]),
            Op::VLoadC => self.vector_mem("ldr", "q30", i.arg[1]),
            Op::VStore => self.vector_mem("str", "q28", i.arg[1]),
            Op::VAdd | Op::VSub | Op::VMul | Op::VDiv => {
                let m = match (i.op, arr.is_float()) {
                    (Op::VAdd, false) => "add",
                    (Op::VAdd, true) => "fadd",
                    (Op::VSub, false) => "sub",
                    (Op::VSub, true) => "fsub",
                    (Op::VMul, true) => "fmul",
                    (Op::VMul, false) => {
                        if arr == VArr::I2D {
                            panic!("no integer vector multiply at .2d");
                        }
                        "mul"
                    }
                    (Op::VDiv, true) => "fdiv",
                    (Op::VDiv, false) => panic!("no integer vector divide"),
                    _ => unreachable!(),
                };
                self.emitf(format_args!(
                    "    {} v28.{}, v28.{}, v29.{}",
                    m, a, a, a
                ))
            }
            Op::VFma => {
                let m = if arr.is_float() {
                    "fmla"
                } else {
                    if arr == VArr::I2D {
                        panic!("no integer vector multiply-add at .2d");
                    }
                    "mla"
                };
                self.emitf(format_args!(
                    "    {} v28.{}, v29.{}, v30.{}",
                    m, a, a, a
                ))
            }
            Op::VSum => {
                let d = i
                    .to
                    .as_reg()
                    .unwrap_or_else(|| panic!("vector reduction into {:?}", i.to));
                match arr {
                    VArr::I4S => {
                        self.emitf(format_args!("    addv s31, v28.4s"))?;
                        let dn = rname(d, Cls::W);
                        self.emitf(format_args!("    fmov {}, s31", dn))
                    }
                    VArr::I2D => {
                        self.emitf(format_args!("    addp d31, v28.2d"))?;
                        let dn = rname(d, Cls::L);
                        self.emitf(format_args!("    fmov {}, d31", dn))
                    }
                    VArr::I8H => {
                        self.emitf(format_args!("    addv h31, v28.8h"))?;
                        let dn = rname(d, Cls::W);
                        self.emitf(format_args!("    smov {}, v31.h[0]", dn))
                    }
                    VArr::I16B => {
                        self.emitf(format_args!("    addv b31, v28.16b"))?;
                        let dn = rname(d, Cls::W);
                        self.emitf(format_args!("    smov {}, v31.b[0]", dn))
                    }
                    VArr::F4S => {
                        // No faddv exists; reduce in two faddp steps.
                        self.emitf(format_args!("    faddp v31.4s, v28.4s, v28.4s"))?;
                        self.emitf(format_args!("    faddp s31, v31.2s"))?;
                        let dn = rname(d, Cls::S);
                        self.emitf(format_args!("    fmov {}, s31", dn))
                    }
                    VArr::F2D => {
                        self.emitf(format_args!("    faddp d31, v28.2d"))?;
                        let dn = rname(d, Cls::D);
                        self.emitf(format_args!("    fmov {}, d31", dn))
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}
