//! Constant materialization and symbol address loads.
//!
//! Integer constants become a single `mov` when the bitmask-immediate
//! encoder accepts them (or when the bit-inverse fits 16 bits for the
//! `movn` alias), otherwise a `mov` of the low lane plus one `movk` per
//! nonzero 16-bit lane. Addresses are page-relative `adrp`+`add` pairs,
//! with the thread-local forms per platform.

use std::io;

use smallvec::SmallVec;

use crate::ir::{Cls, Con, PhysReg, Sym, SymKind, IP1};

use super::emit::Arm64Codegen;
use super::operand_helpers::rname;

/// Can `bits` be encoded as an AArch64 bitmask logical immediate at
/// class `k`?
pub(crate) fn logimm(bits: u64, k: Cls) -> bool {
    let mut v = bits;
    if k == Cls::W {
        v &= 0xffff_ffff;
        v |= v << 32;
    }
    if v == 0 || v == u64::MAX {
        return false;
    }
    // Shrink to the smallest repeating element.
    let mut size = 64u32;
    while size > 2 {
        let half = size / 2;
        let mask = (1u64 << half) - 1;
        if (v & mask) != ((v >> half) & mask) {
            break;
        }
        size = half;
    }
    let mask = if size == 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    };
    let p = v & mask;
    if p == 0 || p == mask {
        return false;
    }
    // The element must be a (possibly wrapping) run of ones.
    is_shifted_mask(p) || is_shifted_mask(!p & mask)
}

fn is_shifted_mask(v: u64) -> bool {
    if v == 0 {
        return false;
    }
    let filled = v | (v - 1);
    filled.wrapping_add(1) & filled == 0
}

/// The `mov`/`movk` plan for an integer constant.
#[derive(Debug)]
pub(crate) enum ConSeq {
    /// A single `mov` (the assembler picks `movz`/`movn`/`orr`).
    Mov(i64),
    /// `mov` of the low lane, then `movk` for each listed (lane, shift).
    Movk {
        low: u16,
        lanes: SmallVec<[(u16, u32); 3]>,
    },
}

/// Plan the load of `bits` at class `k`. Shared by the text and the
/// structured-stream emitters.
pub(crate) fn con_sequence(bits: i64, k: Cls) -> ConSeq {
    let mut n = bits;
    if k == Cls::W {
        n = n as i32 as i64;
    }
    if (n | 0xffff) == -1 || logimm(n as u64, k) {
        return ConSeq::Mov(n);
    }
    let nlanes: u32 = if k == Cls::W { 2 } else { 4 };
    let mut lanes = SmallVec::new();
    for i in 1..nlanes {
        let lane = ((n as u64 >> (16 * i)) & 0xffff) as u16;
        if lane != 0 {
            lanes.push((lane, 16 * i));
        }
    }
    ConSeq::Movk {
        low: (n & 0xffff) as u16,
        lanes,
    }
}

impl<'a> Arm64Codegen<'a> {
    /// Load constant-table entry `ix` into `r` at class `k`.
    pub(super) fn loadcon(&mut self, ix: u32, r: PhysReg, k: Cls) -> io::Result<()> {
        match &self.f.cons[ix as usize] {
            Con::Addr(sym) => {
                let sym = sym.clone();
                let rn = rname(r, Cls::L);
                self.loadaddr(&sym, &rn)
            }
            Con::Bits(n) => {
                let n = *n;
                if k.is_int() {
                    let rn = rname(r, k);
                    self.emit_con_bits(n, &rn, k)
                } else {
                    // Float constants go through the integer scratch and
                    // a bank move.
                    let wide = if k == Cls::D { Cls::L } else { Cls::W };
                    let scratch = rname(IP1, wide);
                    self.emit_con_bits(n, &scratch, wide)?;
                    let rd = rname(r, k);
                    self.emitf(format_args!("    fmov {}, {}", rd, scratch))
                }
            }
        }
    }

    pub(super) fn emit_con_bits(&mut self, n: i64, rn: &str, k: Cls) -> io::Result<()> {
        match con_sequence(n, k) {
            ConSeq::Mov(v) => self.emitf(format_args!("    mov {}, #{}", rn, v)),
            ConSeq::Movk { low, lanes } => {
                self.emitf(format_args!("    mov {}, #{}", rn, low))?;
                for (lane, shift) in lanes {
                    self.emitf(format_args!("    movk {}, #{:#x}, lsl #{}", rn, lane, shift))?;
                }
                Ok(())
            }
        }
    }

    /// Materialize the address of `sym` into the 64-bit register `rn`.
    pub(super) fn loadaddr(&mut self, sym: &Sym, rn: &str) -> io::Result<()> {
        let mut name = self.target.symbol(&sym.name);
        if sym.addend != 0 {
            if sym.addend > 0 {
                name.push('+');
            }
            name.push_str(&sym.addend.to_string());
        }
        let (lo_pre, lo_suf) = self.target.pageoff;
        let pageref = self.target.pageref;
        match sym.kind {
            SymKind::Global => {
                self.emitf(format_args!("    adrp {}, {}{}", rn, name, pageref))?;
                self.emitf(format_args!(
                    "    add {}, {}, {}{}{}",
                    rn, rn, lo_pre, name, lo_suf
                ))
            }
            SymKind::ThreadLocal => {
                if self.target.apple {
                    self.emitf(format_args!("    adrp {}, {}@tlvppage", rn, name))?;
                    self.emitf(format_args!(
                        "    ldr {}, [{}, {}@tlvppageoff]",
                        rn, rn, name
                    ))
                } else {
                    self.emitf(format_args!("    mrs {}, tpidr_el0", rn))?;
                    self.emitf(format_args!(
                        "    add {}, {}, #:tprel_hi12:{}, lsl #12",
                        rn, rn, name
                    ))?;
                    self.emitf(format_args!(
                        "    add {}, {}, #:tprel_lo12_nc:{}",
                        rn, rn, name
                    ))
                }
            }
        }
    }
}
