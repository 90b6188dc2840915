//! Flat intermediate representation consumed by the code generator.
//!
//! Functions arrive here fully optimized and register-allocated: every
//! temporary named by an instruction is a physical register, stack slots
//! are plain indices, and the block layout is fixed by the
//! reverse-post-order array. Nothing in this module is mutated during
//! emission.

use thiserror::Error;

/// Block id. Blocks are stored in a vector and identified by their index.
pub type BlkId = u32;

/// Operand class: width and register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cls {
    /// 32-bit integer
    W,
    /// 64-bit integer
    L,
    /// 32-bit float
    S,
    /// 64-bit float
    D,
}

impl Cls {
    pub fn is_int(self) -> bool {
        matches!(self, Cls::W | Cls::L)
    }

    pub fn is_wide(self) -> bool {
        matches!(self, Cls::L | Cls::D)
    }

    /// Access size in bytes of a full-width load or store of this class.
    pub fn size(self) -> i64 {
        if self.is_wide() {
            8
        } else {
            4
        }
    }
}

/// A physical register id.
///
/// General-purpose registers are 0..=30 (x16/x17 are the intra-procedure
/// scratches, x18 the platform register, x29 the frame pointer, x30 the
/// link register), the stack pointer is 31, and the NEON registers
/// V0..V31 occupy 32..=63.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysReg(pub u8);

pub const IP0: PhysReg = PhysReg(16);
pub const IP1: PhysReg = PhysReg(17);
/// x18: reserved by the Apple ABI, usable as a scratch on ELF targets.
pub const PLATFORM: PhysReg = PhysReg(18);
pub const FP: PhysReg = PhysReg(29);
pub const LR: PhysReg = PhysReg(30);
pub const SP: PhysReg = PhysReg(31);

const VBASE: u8 = 32;

/// The NEON register V<n>.
pub const fn vreg(n: u8) -> PhysReg {
    assert!(n <= 31);
    PhysReg(VBASE + n)
}

/// V31, reserved as the floating-point scratch.
pub const FP_SCRATCH: PhysReg = vreg(31);

impl PhysReg {
    pub fn is_gpr(self) -> bool {
        self.0 <= 30
    }

    pub fn is_sp(self) -> bool {
        self.0 == SP.0
    }

    pub fn is_vec(self) -> bool {
        self.0 >= VBASE
    }

    /// Lane number of a NEON register (V<n> -> n).
    pub fn vec_num(self) -> u8 {
        debug_assert!(self.is_vec());
        self.0 - VBASE
    }
}

/// A set of physical register ids, used for block live-out sets and the
/// callee-save mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegSet(pub u64);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub fn insert(&mut self, r: PhysReg) {
        self.0 |= 1 << r.0;
    }

    pub fn contains(self, r: PhysReg) -> bool {
        self.0 & (1 << r.0) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = PhysReg> {
        (0u8..64).filter(move |&n| self.0 & (1u64 << n) != 0).map(PhysReg)
    }
}

impl FromIterator<PhysReg> for RegSet {
    fn from_iter<T: IntoIterator<Item = PhysReg>>(it: T) -> Self {
        let mut s = RegSet::EMPTY;
        for r in it {
            s.insert(r);
        }
        s
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    None,
    /// A physical register.
    Reg(PhysReg),
    /// An index into the function's constant table.
    Con(u32),
    /// A stack slot: negative ids are spill slots, nonnegative are locals.
    Slot(i32),
}

impl Ref {
    pub fn as_reg(self) -> Option<PhysReg> {
        match self {
            Ref::Reg(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_reg(self) -> bool {
        matches!(self, Ref::Reg(_))
    }

    pub fn is_slot(self) -> bool {
        matches!(self, Ref::Slot(_))
    }
}

/// Symbol linkage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Global,
    ThreadLocal,
}

/// A symbol plus addend.
///
/// A leading `"` in the name suppresses the platform's external-symbol
/// prefix; the quote itself is never printed.
#[derive(Debug, Clone, PartialEq)]
pub struct Sym {
    pub name: String,
    pub addend: i64,
    pub kind: SymKind,
}

/// An entry of the function's constant table.
#[derive(Debug, Clone, PartialEq)]
pub enum Con {
    /// A 64-bit bit pattern (sign-agnostic).
    Bits(i64),
    /// A symbol-relative address.
    Addr(Sym),
}

/// An AArch64 condition code. Discriminants are the architectural
/// encoding values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
}

impl Cond {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Hs => "hs",
            Cond::Lo => "lo",
            Cond::Mi => "mi",
            Cond::Pl => "pl",
            Cond::Vs => "vs",
            Cond::Vc => "vc",
            Cond::Hi => "hi",
            Cond::Ls => "ls",
            Cond::Ge => "ge",
            Cond::Lt => "lt",
            Cond::Gt => "gt",
            Cond::Le => "le",
        }
    }

    /// The condition that holds exactly when `self` does not.
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Hs => Cond::Lo,
            Cond::Lo => Cond::Hs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }

    /// The architectural 4-bit encoding.
    pub fn arch(self) -> u8 {
        self as u8
    }
}

/// NEON arrangement selector, carried as a `Con::Bits` value in the first
/// argument of the vector opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VArr {
    /// four 32-bit integer lanes
    I4S,
    /// two 64-bit integer lanes
    I2D,
    /// eight 16-bit integer lanes
    I8H,
    /// sixteen 8-bit integer lanes
    I16B,
    /// four single-precision lanes
    F4S,
    /// two double-precision lanes
    F2D,
}

impl VArr {
    pub fn from_bits(bits: i64) -> Option<VArr> {
        match bits {
            0 => Some(VArr::I4S),
            1 => Some(VArr::I2D),
            2 => Some(VArr::I8H),
            3 => Some(VArr::I16B),
            4 => Some(VArr::F4S),
            5 => Some(VArr::F2D),
            _ => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, VArr::F4S | VArr::F2D)
    }

    /// The textual arrangement specifier, without the leading dot.
    pub fn spec(self) -> &'static str {
        match self {
            VArr::I4S | VArr::F4S => "4s",
            VArr::I2D | VArr::F2D => "2d",
            VArr::I8H => "8h",
            VArr::I16B => "16b",
        }
    }
}

/// An opcode. The result class of the instruction refines most of these;
/// loads without an explicit width use the instruction class, stores
/// carry their width in the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // Integer and float arithmetic.
    Add,
    Sub,
    Neg,
    Mul,
    Div,
    UDiv,
    Rem,
    URem,
    And,
    Or,
    Xor,
    Sar,
    Shr,
    Shl,
    // Loads. `Load` uses the instruction class for its width; the others
    // extend a narrower memory value into an integer register.
    Load,
    LoadSW,
    LoadUW,
    LoadSH,
    LoadUH,
    LoadSB,
    LoadUB,
    // Stores: value in arg0, address in arg1.
    StoreL,
    StoreW,
    StoreH,
    StoreB,
    StoreD,
    StoreS,
    // Flag producers and consumers.
    Cmp,
    Cmn,
    FCmp,
    /// Materialize a condition into a register (`cset`).
    Set(Cond),
    // Register motion and odds and ends.
    Copy,
    Swap,
    /// Take the address of a stack slot.
    Addr,
    /// Grow the stack downward (dynamic alloca).
    SAlloc,
    Call,
    Nop,
    // Integer width changes.
    ExtSB,
    ExtUB,
    ExtSH,
    ExtUH,
    ExtSW,
    ExtUW,
    // Float conversions.
    /// single -> double
    ExtS,
    /// double -> single
    TruncD,
    StoSI,
    StoUI,
    DtoSI,
    DtoUI,
    SWtoF,
    UWtoF,
    SLtoF,
    ULtoF,
    /// Bit-pattern move between banks.
    Cast,
    // 128-bit vector operations on the fixed scratch registers V28/V29
    // (V30 for the fused multiply-add). arg0 is the arrangement tag.
    VLoadA,
    VLoadB,
    VLoadC,
    VStore,
    VAdd,
    VSub,
    VMul,
    VDiv,
    VFma,
    /// Horizontal reduction of V28 into a scalar destination.
    VSum,
}

impl Op {
    pub fn is_load(self) -> bool {
        matches!(
            self,
            Op::Load
                | Op::LoadSW
                | Op::LoadUW
                | Op::LoadSH
                | Op::LoadUH
                | Op::LoadSB
                | Op::LoadUB
        )
    }

    pub fn is_store(self) -> bool {
        matches!(
            self,
            Op::StoreL | Op::StoreW | Op::StoreH | Op::StoreB | Op::StoreD | Op::StoreS
        )
    }

    /// Access size in bytes of a memory operation, `None` for others.
    pub fn mem_size(self, cls: Cls) -> Option<i64> {
        match self {
            Op::Load => Some(cls.size()),
            Op::LoadSW | Op::LoadUW => Some(4),
            Op::LoadSH | Op::LoadUH => Some(2),
            Op::LoadSB | Op::LoadUB => Some(1),
            Op::StoreL | Op::StoreD => Some(8),
            Op::StoreW | Op::StoreS => Some(4),
            Op::StoreH => Some(2),
            Op::StoreB => Some(1),
            _ => None,
        }
    }

    /// The argument holding the memory address of a load or store.
    pub fn mem_arg(self) -> Option<usize> {
        if self.is_load() {
            Some(0)
        } else if self.is_store() {
            Some(1)
        } else {
            None
        }
    }
}

/// An instruction: opcode, result class, destination, two arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ins {
    pub op: Op,
    pub cls: Cls,
    pub to: Ref,
    pub arg: [Ref; 2],
}

impl Ins {
    pub fn new(op: Op, cls: Cls, to: Ref, arg: [Ref; 2]) -> Ins {
        Ins { op, cls, to, arg }
    }
}

/// A block terminator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jmp {
    /// Trap; emitted for unreachable code.
    Halt,
    /// Function return. The argument, if any, names the register carrying
    /// the return value (already placed by the ABI lowering).
    Ret(Ref),
    Jmp(BlkId),
    /// Conditional branch on the current flags: `s1` when `cond` holds,
    /// `s2` otherwise. The argument names the register the flags were
    /// computed from when the comparison was against zero.
    Jnz {
        cond: Cond,
        arg: Ref,
        s1: BlkId,
        s2: BlkId,
    },
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Blk {
    pub id: BlkId,
    pub npred: u32,
    pub ins: Vec<Ins>,
    pub jmp: Jmp,
    /// Live physical registers at the block's end, from the final
    /// liveness pass.
    pub out: RegSet,
}

/// Linkage of a function.
#[derive(Debug, Clone, Default)]
pub struct Lnk {
    pub export: bool,
    pub align: Option<u32>,
}

/// A function ready for emission.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub lnk: Lnk,
    pub blks: Vec<Blk>,
    /// Layout order: block ids in reverse post-order. Emission walks this
    /// array; `rpo[i+1]` is the fall-through successor of `rpo[i]`.
    pub rpo: Vec<BlkId>,
    pub cons: Vec<Con>,
    /// Stack slot count, in 4-byte units.
    pub slot: u32,
    pub vararg: bool,
    pub dynalloc: bool,
    /// Callee-save registers the allocator actually used.
    pub reg: RegSet,
}

/// Container-level violations of the input contract, detected before any
/// output is produced. Type errors inside instructions are a compiler
/// bug and abort instead (see the backend).
#[derive(Debug, Error)]
pub enum IrError {
    #[error("function {0}: block {1} has id {2}, expected ids to match indices")]
    BadBlockId(String, usize, BlkId),
    #[error("function {0}: layout order visits block {1} {2} times")]
    BadLayout(String, BlkId, usize),
    #[error("function {0}: block {1} branches to unknown block {2}")]
    BadSuccessor(String, BlkId, BlkId),
    #[error("function {0}: reference to constant {1} out of range")]
    BadConstant(String, u32),
    #[error("function {0}: symbol name {1:?} is too long")]
    LongSymbol(String, String),
}

/// Longest symbol name the structured-stream records can carry.
pub const SYM_NAME_MAX: usize = 79;

impl Func {
    pub fn blk(&self, id: BlkId) -> &Blk {
        &self.blks[id as usize]
    }

    /// Check the container-level input contract: ids match indices, the
    /// layout order covers every block exactly once, successors exist,
    /// and constant references are in range.
    pub fn validate(&self) -> Result<(), IrError> {
        let n = self.blks.len();
        for (i, b) in self.blks.iter().enumerate() {
            if b.id as usize != i {
                return Err(IrError::BadBlockId(self.name.clone(), i, b.id));
            }
        }
        let mut seen = vec![0usize; n];
        for &id in &self.rpo {
            if id as usize >= n {
                return Err(IrError::BadSuccessor(self.name.clone(), id, id));
            }
            seen[id as usize] += 1;
        }
        for (i, &count) in seen.iter().enumerate() {
            if count != 1 {
                return Err(IrError::BadLayout(self.name.clone(), i as BlkId, count));
            }
        }
        let check_succ = |from: BlkId, to: BlkId| {
            if to as usize >= n {
                Err(IrError::BadSuccessor(self.name.clone(), from, to))
            } else {
                Ok(())
            }
        };
        let check_ref = |r: Ref| match r {
            Ref::Con(ix) => {
                if ix as usize >= self.cons.len() {
                    return Err(IrError::BadConstant(self.name.clone(), ix));
                }
                if let Con::Addr(sym) = &self.cons[ix as usize] {
                    let printed = sym.name.strip_prefix('"').unwrap_or(&sym.name);
                    if printed.len() > SYM_NAME_MAX {
                        return Err(IrError::LongSymbol(self.name.clone(), sym.name.clone()));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        };
        for b in &self.blks {
            for i in &b.ins {
                check_ref(i.to)?;
                check_ref(i.arg[0])?;
                check_ref(i.arg[1])?;
            }
            match b.jmp {
                Jmp::Jmp(s1) => check_succ(b.id, s1)?,
                Jmp::Jnz { arg, s1, s2, .. } => {
                    check_ref(arg)?;
                    check_succ(b.id, s1)?;
                    check_succ(b.id, s2)?;
                }
                Jmp::Ret(arg) => check_ref(arg)?,
                Jmp::Halt => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_block_fn(jmp: Jmp) -> Func {
        Func {
            name: "f".into(),
            lnk: Lnk::default(),
            blks: vec![Blk {
                id: 0,
                npred: 1,
                ins: vec![],
                jmp,
                out: RegSet::EMPTY,
            }],
            rpo: vec![0],
            cons: vec![],
            slot: 0,
            vararg: false,
            dynalloc: false,
            reg: RegSet::EMPTY,
        }
    }

    #[test]
    fn cond_negation_is_involutive() {
        for c in [
            Cond::Eq,
            Cond::Ne,
            Cond::Hs,
            Cond::Lo,
            Cond::Mi,
            Cond::Pl,
            Cond::Vs,
            Cond::Vc,
            Cond::Hi,
            Cond::Ls,
            Cond::Ge,
            Cond::Lt,
            Cond::Gt,
            Cond::Le,
        ] {
            assert_eq!(c.negate().negate(), c);
            assert_ne!(c.negate(), c);
        }
    }

    #[test]
    fn cond_arch_encodings() {
        assert_eq!(Cond::Eq.arch(), 0);
        assert_eq!(Cond::Ne.arch(), 1);
        assert_eq!(Cond::Ge.arch(), 10);
        assert_eq!(Cond::Le.arch(), 13);
    }

    #[test]
    fn regset_basics() {
        let mut s = RegSet::EMPTY;
        s.insert(PhysReg(3));
        s.insert(FP_SCRATCH);
        assert!(s.contains(PhysReg(3)));
        assert!(s.contains(FP_SCRATCH));
        assert!(!s.contains(PhysReg(4)));
        assert_eq!(s.iter().count(), 2);
    }

    #[test]
    fn validate_accepts_minimal_function() {
        let f = one_block_fn(Jmp::Ret(Ref::None));
        assert!(f.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_successor() {
        let f = one_block_fn(Jmp::Jmp(7));
        assert!(matches!(f.validate(), Err(IrError::BadSuccessor(..))));
    }

    #[test]
    fn validate_rejects_duplicate_layout_entry() {
        let mut f = one_block_fn(Jmp::Ret(Ref::None));
        f.rpo = vec![0, 0];
        assert!(matches!(f.validate(), Err(IrError::BadLayout(..))));
    }

    #[test]
    fn mem_sizes() {
        assert_eq!(Op::Load.mem_size(Cls::W), Some(4));
        assert_eq!(Op::Load.mem_size(Cls::D), Some(8));
        assert_eq!(Op::LoadSB.mem_size(Cls::L), Some(1));
        assert_eq!(Op::StoreH.mem_size(Cls::W), Some(2));
        assert_eq!(Op::Add.mem_size(Cls::W), None);
    }
}
