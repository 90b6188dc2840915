//! Out-of-range slot handling for loads and stores.
//!
//! The scaled unsigned displacement of a load or store covers
//! access-size × 4095 bytes. A slot beyond that range has its address
//! materialized into a fixup scratch register. Stores of constants also
//! consume a scratch for the value; when the platform has no scratch
//! left for the address, the value moves into V31 and the store switches
//! to the FP register form.

use std::io;

use crate::ir::{Cls, Ins, Op, PhysReg, Ref, FP_SCRATCH};

use super::emit::Arm64Codegen;
use super::operand_helpers::rname;

/// Class of the value a store writes to memory.
fn store_val_cls(op: Op) -> Cls {
    match op {
        Op::StoreL => Cls::L,
        Op::StoreD => Cls::D,
        Op::StoreS => Cls::S,
        _ => Cls::W,
    }
}

impl<'a> Arm64Codegen<'a> {
    /// Materialize `x29 + off` into `scr`.
    pub(super) fn addr_into(&mut self, scr: PhysReg, off: i64) -> io::Result<()> {
        let rn = rname(scr, Cls::L);
        if off <= 4095 {
            self.emitf(format_args!("    add {}, x29, #{}", rn, off))
        } else {
            self.emit_con_bits(off, &rn, Cls::L)?;
            self.emitf(format_args!("    add {}, x29, {}", rn, rn))
        }
    }

    /// Rewrite the operands of a memory instruction so they can be
    /// rendered directly: far slots become scratch-register addresses and
    /// constant store values are materialized. Returns the instruction to
    /// run through the selection table, or `None` when the store was
    /// already emitted in its rerouted FP form.
    pub(super) fn fixup_mem(&mut self, i: &Ins) -> io::Result<Option<Ins>> {
        let size = match i.op.mem_size(i.cls) {
            Some(s) => s,
            None => return Ok(Some(*i)),
        };
        let mut i = *i;
        let mut scratch = self.target.fixup_scratch.iter().copied();

        // A stored constant needs a register first.
        let mut value_scratch = None;
        if i.op.is_store() {
            match i.arg[0] {
                Ref::Con(ix) => {
                    let vcls = store_val_cls(i.op);
                    if vcls.is_int() {
                        let scr = scratch
                            .next()
                            .unwrap_or_else(|| panic!("no scratch for stored constant"));
                        self.loadcon(ix, scr, vcls)?;
                        i.arg[0] = Ref::Reg(scr);
                        value_scratch = Some(scr);
                    } else {
                        // Float constants land in V31 without consuming a
                        // fixup scratch.
                        self.loadcon(ix, FP_SCRATCH, vcls)?;
                        i.arg[0] = Ref::Reg(FP_SCRATCH);
                    }
                }
                Ref::Slot(_) => panic!("stored value must be a register, got {:?}", i.arg[0]),
                _ => {}
            }
        }

        let addr_ix = i.op.mem_arg().unwrap();
        match i.arg[addr_ix] {
            Ref::Slot(s) => {
                let off = self.layout.slot_off(s);
                if off > size * 4095 {
                    match scratch.next() {
                        Some(scr) => {
                            self.addr_into(scr, off)?;
                            i.arg[addr_ix] = Ref::Reg(scr);
                        }
                        None => {
                            // The value holds the only scratch. Move it to
                            // V31, reuse the scratch for the address, and
                            // store from the FP bank.
                            let scr = value_scratch.expect("store fixup without a value scratch");
                            let (mov, vn) = match size {
                                1 => ("fmov s31, w", "b31"),
                                2 => ("fmov s31, w", "h31"),
                                4 => ("fmov s31, w", "s31"),
                                _ => ("fmov d31, x", "d31"),
                            };
                            self.emitf(format_args!("    {}{}", mov, scr.0))?;
                            self.addr_into(scr, off)?;
                            let a = rname(scr, Cls::L);
                            self.emitf(format_args!("    str {}, [{}]", vn, a))?;
                            return Ok(None);
                        }
                    }
                }
            }
            Ref::Con(ix) => {
                // A symbolic address: materialize it like any other
                // constant.
                let scr = scratch
                    .next()
                    .unwrap_or_else(|| panic!("no scratch for address constant"));
                self.loadcon(ix, scr, Cls::L)?;
                i.arg[addr_ix] = Ref::Reg(scr);
            }
            Ref::Reg(_) => {}
            Ref::None => panic!("memory instruction {:?} without an address", i.op),
        }
        Ok(Some(i))
    }
}
