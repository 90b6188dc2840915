//! Operand rendering: register names, memory operands, and the ALU
//! second-operand immediate rules.

use crate::ir::{Cls, Con, PhysReg, Ref};

use super::const_helpers::logimm;
use super::emit::Arm64Codegen;

/// Render a physical register at a class. The stack pointer is only
/// nameable at the 64-bit class; general registers pick `w`/`x`, NEON
/// registers pick `s`/`d`.
pub(super) fn rname(r: PhysReg, k: Cls) -> String {
    if r.is_sp() {
        assert!(k == Cls::L, "sp used at class {:?}", k);
        return "sp".to_string();
    }
    if r.is_gpr() {
        match k {
            Cls::W => format!("w{}", r.0),
            Cls::L => format!("x{}", r.0),
            _ => panic!("general register x{} used at class {:?}", r.0, k),
        }
    } else {
        match k {
            Cls::S => format!("s{}", r.vec_num()),
            Cls::D => format!("d{}", r.vec_num()),
            _ => panic!("vector register v{} used at class {:?}", r.vec_num(), k),
        }
    }
}

/// How an ALU second-operand immediate encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AluImm {
    /// Plain unsigned 12-bit field.
    Plain(i64),
    /// 12-bit field shifted left by 12; the value is pre-shifted.
    Lsl12(i64),
    /// Bitmask logical immediate, carried as the full value.
    Mask(i64),
}

/// Classify an ALU second-operand immediate. Values with bits above 24
/// must be bitmask logical immediates; a value that only populates the
/// upper 12-bit field uses the shifted form; everything else is the
/// plain unsigned 12-bit form. Anything outside those three is a fatal
/// encoding error.
pub(crate) fn classify_alu_imm(n: i64, k: Cls) -> AluImm {
    let u = n as u64;
    if (u >> 24) != 0 {
        assert!(
            logimm(u, k),
            "immediate {:#x} not encodable at class {:?}",
            u,
            k
        );
        return AluImm::Mask(n);
    }
    if u & 0xfff == 0 && u != 0 {
        return AluImm::Lsl12((u >> 12) as i64);
    }
    assert!(u <= 0xfff, "immediate {:#x} not encodable at class {:?}", u, k);
    AluImm::Plain(u as i64)
}

/// Format an ALU second-operand immediate.
pub(super) fn alu_imm(n: i64, k: Cls) -> String {
    match classify_alu_imm(n, k) {
        AluImm::Mask(v) => format!("#{}", v),
        AluImm::Lsl12(v) => format!("#{}, lsl #12", v),
        AluImm::Plain(v) => format!("#{}", v),
    }
}

impl<'a> Arm64Codegen<'a> {
    /// Render a non-memory operand at class `k`.
    pub(super) fn operand(&self, r: Ref, k: Cls) -> String {
        match r {
            Ref::Reg(reg) => rname(reg, k),
            Ref::Con(ix) => match &self.f.cons[ix as usize] {
                Con::Bits(n) => {
                    assert!(k.is_int(), "float operand cannot be an immediate");
                    alu_imm(*n, k)
                }
                Con::Addr(sym) => {
                    panic!("address constant {} used as an ALU operand", sym.name)
                }
            },
            Ref::Slot(s) => panic!("stack slot {} used where a register is required", s),
            Ref::None => panic!("missing operand"),
        }
    }

    /// Render a memory operand: a plain register base or a frame slot.
    pub(super) fn mem_operand(&self, r: Ref) -> String {
        match r {
            Ref::Reg(reg) => format!("[{}]", rname(reg, Cls::L)),
            Ref::Slot(s) => format!("[x29, #{}]", self.layout.slot_off(s)),
            _ => panic!("bad address operand {:?}", r),
        }
    }
}
