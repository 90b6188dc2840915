//! Structured instruction stream.
//!
//! The same walk the text emitter performs, appending fixed-width
//! records instead of printing lines. The records feed an out-of-process
//! machine-code encoder, so the contract is strict: the record sequence
//! mirrors the instruction sequence the text emitter would have
//! produced, fusion decisions included (they come from the same
//! decision functions).

use crate::backend::{EmitError, Target};
use crate::ir::{
    Blk, BlkId, Cls, Con, Cond, Func, Ins, Jmp, Op, PhysReg, Ref, Sym, SymKind, VArr, FP_SCRATCH,
    IP1, SYM_NAME_MAX,
};

use super::codegen::{candidate, cmp_zero, try_fuse, FrameLayout, Fused};
use super::codegen::{classify_alu_imm, con_sequence, AluImm, ConSeq};
use super::flags::EmitCfg;

/// A register slot of a record. The tagged form keeps the encoder free
/// of sentinel arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamReg {
    #[default]
    None,
    Sp,
    Fp,
    Lr,
    Ip0,
    Ip1,
    Gpr(u8),
    VReg(u8),
}

impl StreamReg {
    pub fn from_phys(r: PhysReg) -> StreamReg {
        match r.0 {
            16 => StreamReg::Ip0,
            17 => StreamReg::Ip1,
            29 => StreamReg::Fp,
            30 => StreamReg::Lr,
            31 => StreamReg::Sp,
            n if n <= 30 => StreamReg::Gpr(n),
            n => StreamReg::VReg(n - 32),
        }
    }
}

/// Class tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecCls {
    #[default]
    None,
    W,
    L,
    S,
    D,
}

impl RecCls {
    fn of(k: Cls) -> RecCls {
        match k {
            Cls::W => RecCls::W,
            Cls::L => RecCls::L,
            Cls::S => RecCls::S,
            Cls::D => RecCls::D,
        }
    }
}

/// Shift decoration of a record operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecShift {
    #[default]
    None,
    Lsl(u8),
    Lsr(u8),
    Asr(u8),
}

/// Record kinds: one per mnemonic family the emitter produces, plus the
/// structural markers and the data directives the data emitter appends
/// to the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecKind {
    // Structure.
    Label,
    FnBegin,
    FnEnd,
    Comment,
    // Control flow.
    Hint,
    Brk,
    Ret,
    B,
    BCond,
    Cbz,
    Cbnz,
    Bl,
    Blr,
    // Moves and constants. `MovImm`/`Movk` use imm0 (+ shift tag);
    // register moves use regs 0-1.
    Mov,
    MovImm,
    Movk,
    Fmov,
    // Address materialization.
    Adrp,
    AddPageOff,
    MrsTp,
    AddTprelHi,
    AddTprelLo,
    LdrTlvp,
    // ALU. Register forms fill regs 0-2; immediate forms leave reg2
    // empty and use imm0 (shift tag `Lsl(12)` marks the shifted field).
    Add,
    Sub,
    Neg,
    Mul,
    Madd,
    Msub,
    Fmadd,
    Sdiv,
    Udiv,
    And,
    Orr,
    Eor,
    Lsl,
    Lsr,
    Asr,
    Cmp,
    Cmn,
    Fcmp,
    Cset,
    // Width changes.
    Sxtb,
    Sxth,
    Sxtw,
    Uxtb,
    Uxth,
    Scvtf,
    Ucvtf,
    Fcvtzs,
    Fcvtzu,
    Fcvt,
    // Memory. regs: value, base [, index]; imm0 is the displacement when
    // reg2 is empty. `StpPre`/`LdpPost` are the frame push/pop forms.
    Ldr,
    Ldrb,
    Ldrh,
    Ldrsb,
    Ldrsh,
    Ldrsw,
    Str,
    Strb,
    Strh,
    Ldp,
    Stp,
    StpPre,
    LdpPost,
    LdrQ,
    StrQ,
    // Vector, on the fixed scratch registers. imm1 carries the
    // arrangement tag.
    Vadd,
    Vsub,
    Vmul,
    Vdiv,
    Vmla,
    Vaddv,
    Vaddp,
    Vfaddp,
    Vsmov,
    // Data directives, appended by the data emitter.
    DataByte,
    DataHalf,
    DataWord,
    DataQuad,
    DataAsciz,
    DataZero,
}

/// Inline symbol-name buffer: up to 79 bytes plus the terminator.
#[derive(Clone, Copy)]
pub struct SymBuf {
    len: u8,
    buf: [u8; SYM_NAME_MAX + 1],
}

impl SymBuf {
    pub fn empty() -> SymBuf {
        SymBuf {
            len: 0,
            buf: [0; SYM_NAME_MAX + 1],
        }
    }

    pub fn new(name: &str) -> SymBuf {
        assert!(
            name.len() <= SYM_NAME_MAX,
            "symbol {:?} does not fit a record",
            name
        );
        let mut buf = [0u8; SYM_NAME_MAX + 1];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        SymBuf {
            len: name.len() as u8,
            buf,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf[..self.len as usize]).unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for SymBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl PartialEq for SymBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// One fixed-width stream record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsmRec {
    pub kind: RecKind,
    pub cls: RecCls,
    pub cond: Option<Cond>,
    pub shift: RecShift,
    pub regs: [StreamReg; 4],
    pub imm: [i64; 2],
    /// Branch-target / label id; negative when absent.
    pub target: i32,
    pub sym: SymBuf,
}

impl AsmRec {
    fn new(kind: RecKind) -> AsmRec {
        AsmRec {
            kind,
            cls: RecCls::None,
            cond: None,
            shift: RecShift::None,
            regs: [StreamReg::None; 4],
            imm: [0; 2],
            target: -1,
            sym: SymBuf::empty(),
        }
    }
}

/// Record-building helpers keep the emitter terse.
struct RecBuild(AsmRec);

impl RecBuild {
    fn kind(k: RecKind) -> RecBuild {
        RecBuild(AsmRec::new(k))
    }
    fn cls(mut self, k: Cls) -> RecBuild {
        self.0.cls = RecCls::of(k);
        self
    }
    fn cond(mut self, c: Cond) -> RecBuild {
        self.0.cond = Some(c);
        self
    }
    fn shift(mut self, s: RecShift) -> RecBuild {
        self.0.shift = s;
        self
    }
    fn reg(mut self, ix: usize, r: PhysReg) -> RecBuild {
        self.0.regs[ix] = StreamReg::from_phys(r);
        self
    }
    fn imm(mut self, ix: usize, v: i64) -> RecBuild {
        self.0.imm[ix] = v;
        self
    }
    fn target(mut self, t: u32) -> RecBuild {
        self.0.target = t as i32;
        self
    }
    fn sym(mut self, s: &str) -> RecBuild {
        self.0.sym = SymBuf::new(s);
        self
    }
    fn done(self) -> AsmRec {
        self.0
    }
}

/// A compilation unit for the stream output; label ids stay unique
/// across its functions.
#[derive(Default)]
pub struct StreamUnit {
    next_label: u32,
}

impl StreamUnit {
    pub fn new() -> StreamUnit {
        StreamUnit::default()
    }

    pub fn emit(
        &mut self,
        f: &Func,
        target: &Target,
        cfg: &EmitCfg,
    ) -> Result<Vec<AsmRec>, EmitError> {
        f.validate()?;
        log::debug!("streaming {} ({} blocks)", f.name, f.blks.len());
        let label_base = self.next_label;
        self.next_label += f.blks.len() as u32;
        let mut cg = StreamCodegen {
            f,
            target,
            cfg,
            layout: FrameLayout::of(f, target),
            recs: Vec::new(),
            pending: None,
            label_base,
        };
        cg.emit_fn();
        Ok(cg.recs)
    }
}

/// Emit one function's records through a fresh unit.
pub fn emit_stream(f: &Func, target: &Target, cfg: &EmitCfg) -> Result<Vec<AsmRec>, EmitError> {
    StreamUnit::new().emit(f, target, cfg)
}

struct StreamCodegen<'a> {
    f: &'a Func,
    target: &'a Target,
    cfg: &'a EmitCfg,
    layout: FrameLayout,
    recs: Vec<AsmRec>,
    pending: Option<Ins>,
    label_base: u32,
}

impl<'a> StreamCodegen<'a> {
    fn push(&mut self, r: RecBuild) {
        self.recs.push(r.done());
    }

    fn label_id(&self, b: BlkId) -> u32 {
        self.label_base + b
    }

    fn emit_fn(&mut self) {
        let f = self.f;
        let name = self.target.symbol(&f.name);
        let begin = RecBuild::kind(RecKind::FnBegin)
            .sym(&name)
            .imm(0, f.lnk.export as i64)
            .imm(1, f.lnk.align.map(i64::from).unwrap_or(0));
        self.push(begin);
        self.push(RecBuild::kind(RecKind::Hint).imm(0, 34));
        self.emit_prologue();

        let mut fell = true;
        for pos in 0..f.rpo.len() {
            let blk = f.blk(f.rpo[pos]);
            let next = f.rpo.get(pos + 1).copied();
            if !fell || blk.npred > 1 {
                let id = self.label_id(blk.id);
                self.push(RecBuild::kind(RecKind::Label).target(id));
            }
            for idx in 0..blk.ins.len() {
                self.step_ins(blk, idx);
            }
            fell = self.emit_jmp(blk, next);
        }

        let end = RecBuild::kind(RecKind::FnEnd).sym(&name);
        self.push(end);
    }

    // ── Frame ───────────────────────────────────────────────────────────

    fn mov_imm(&mut self, r: PhysReg, k: Cls, n: i64) {
        match con_sequence(n, k) {
            ConSeq::Mov(v) => {
                self.push(RecBuild::kind(RecKind::MovImm).cls(k).reg(0, r).imm(0, v));
            }
            ConSeq::Movk { low, lanes } => {
                self.push(
                    RecBuild::kind(RecKind::MovImm)
                        .cls(k)
                        .reg(0, r)
                        .imm(0, low as i64),
                );
                for (lane, shift) in lanes {
                    self.push(
                        RecBuild::kind(RecKind::Movk)
                            .cls(k)
                            .reg(0, r)
                            .imm(0, lane as i64)
                            .shift(RecShift::Lsl(shift as u8)),
                    );
                }
            }
        }
    }

    fn emit_prologue(&mut self) {
        let n = self.layout.frame + 16;
        let (fp, lr, sp) = (crate::ir::FP, crate::ir::LR, crate::ir::SP);
        let ip0 = crate::ir::IP0;
        if n <= 504 {
            self.push(
                RecBuild::kind(RecKind::StpPre)
                    .cls(Cls::L)
                    .reg(0, fp)
                    .reg(1, lr)
                    .reg(2, sp)
                    .imm(0, -n),
            );
        } else {
            if n <= 4095 {
                self.push(
                    RecBuild::kind(RecKind::Sub)
                        .cls(Cls::L)
                        .reg(0, sp)
                        .reg(1, sp)
                        .imm(0, n),
                );
            } else if n <= 65535 {
                self.push(RecBuild::kind(RecKind::MovImm).cls(Cls::L).reg(0, ip0).imm(0, n));
                self.push(
                    RecBuild::kind(RecKind::Sub)
                        .cls(Cls::L)
                        .reg(0, sp)
                        .reg(1, sp)
                        .reg(2, ip0),
                );
            } else {
                self.push(
                    RecBuild::kind(RecKind::MovImm)
                        .cls(Cls::L)
                        .reg(0, ip0)
                        .imm(0, n & 0xffff),
                );
                self.push(
                    RecBuild::kind(RecKind::Movk)
                        .cls(Cls::L)
                        .reg(0, ip0)
                        .imm(0, n >> 16)
                        .shift(RecShift::Lsl(16)),
                );
                self.push(
                    RecBuild::kind(RecKind::Sub)
                        .cls(Cls::L)
                        .reg(0, sp)
                        .reg(1, sp)
                        .reg(2, ip0),
                );
            }
            self.push(
                RecBuild::kind(RecKind::StpPre)
                    .cls(Cls::L)
                    .reg(0, fp)
                    .reg(1, lr)
                    .reg(2, sp)
                    .imm(0, -16),
            );
        }
        self.push(RecBuild::kind(RecKind::Mov).cls(Cls::L).reg(0, fp).reg(1, sp));
        self.emit_saves(false);
        if let Some(base) = self.layout.vararg_off {
            for i in 0..8u8 {
                self.push(
                    RecBuild::kind(RecKind::Str)
                        .cls(Cls::L)
                        .reg(0, PhysReg(i))
                        .reg(1, fp)
                        .imm(0, base + 8 * i as i64),
                );
            }
            for i in 0..8u8 {
                self.push(
                    RecBuild::kind(RecKind::StrQ)
                        .reg(0, crate::ir::vreg(i))
                        .reg(1, fp)
                        .imm(0, base + 64 + 16 * i as i64),
                );
            }
        }
    }

    fn emit_epilogue(&mut self) {
        self.emit_saves(true);
        let (fp, lr, sp) = (crate::ir::FP, crate::ir::LR, crate::ir::SP);
        let ip0 = crate::ir::IP0;
        if self.f.dynalloc {
            self.push(RecBuild::kind(RecKind::Mov).cls(Cls::L).reg(0, sp).reg(1, fp));
        }
        let n = self.layout.frame + 16;
        if n <= 504 {
            self.push(
                RecBuild::kind(RecKind::LdpPost)
                    .cls(Cls::L)
                    .reg(0, fp)
                    .reg(1, lr)
                    .reg(2, sp)
                    .imm(0, n),
            );
        } else {
            self.push(
                RecBuild::kind(RecKind::LdpPost)
                    .cls(Cls::L)
                    .reg(0, fp)
                    .reg(1, lr)
                    .reg(2, sp)
                    .imm(0, 16),
            );
            if n <= 4095 {
                self.push(
                    RecBuild::kind(RecKind::Add)
                        .cls(Cls::L)
                        .reg(0, sp)
                        .reg(1, sp)
                        .imm(0, n),
                );
            } else {
                if n <= 65535 {
                    self.push(RecBuild::kind(RecKind::MovImm).cls(Cls::L).reg(0, ip0).imm(0, n));
                } else {
                    self.push(
                        RecBuild::kind(RecKind::MovImm)
                            .cls(Cls::L)
                            .reg(0, ip0)
                            .imm(0, n & 0xffff),
                    );
                    self.push(
                        RecBuild::kind(RecKind::Movk)
                            .cls(Cls::L)
                            .reg(0, ip0)
                            .imm(0, n >> 16)
                            .shift(RecShift::Lsl(16)),
                    );
                }
                self.push(
                    RecBuild::kind(RecKind::Add)
                        .cls(Cls::L)
                        .reg(0, sp)
                        .reg(1, sp)
                        .reg(2, ip0),
                );
            }
        }
        self.push(RecBuild::kind(RecKind::Ret));
    }

    fn emit_saves(&mut self, restore: bool) {
        let fp = crate::ir::FP;
        let saves = self.layout.saves.clone();
        let mut i = 0;
        while i < saves.len() {
            let (r1, o1) = saves[i];
            let k = if r1.is_vec() { Cls::D } else { Cls::L };
            if i + 1 < saves.len() {
                let (r2, o2) = saves[i + 1];
                if r1.is_vec() == r2.is_vec() && o2 == o1 + 8 && o1 <= 504 {
                    let kind = if restore { RecKind::Ldp } else { RecKind::Stp };
                    self.push(
                        RecBuild::kind(kind)
                            .cls(k)
                            .reg(0, r1)
                            .reg(1, r2)
                            .reg(2, fp)
                            .imm(0, o1),
                    );
                    i += 2;
                    continue;
                }
            }
            let kind = if restore { RecKind::Ldr } else { RecKind::Str };
            self.push(RecBuild::kind(kind).cls(k).reg(0, r1).reg(1, fp).imm(0, o1));
            i += 1;
        }
    }

    // ── Control flow ────────────────────────────────────────────────────

    fn emit_jmp(&mut self, blk: &Blk, next: Option<BlkId>) -> bool {
        match blk.jmp {
            Jmp::Halt => {
                self.flush_pending();
                self.push(RecBuild::kind(RecKind::Brk).imm(0, 1000));
                false
            }
            Jmp::Ret(_) => {
                self.flush_pending();
                self.emit_epilogue();
                false
            }
            Jmp::Jmp(s1) => {
                self.flush_pending();
                self.emit_goto(s1, next)
            }
            Jmp::Jnz { cond, s1, s2, .. } => {
                let (bc, btarget, jtarget) = if next == Some(s2) {
                    (cond, s1, s2)
                } else {
                    (cond.negate(), s2, s1)
                };
                if let Some(p) = self.pending {
                    if let Some(r) = cmp_zero(&self.f.cons, &p) {
                        if bc == Cond::Eq || bc == Cond::Ne {
                            self.pending = None;
                            let kind = if bc == Cond::Eq {
                                RecKind::Cbz
                            } else {
                                RecKind::Cbnz
                            };
                            let id = self.label_id(btarget);
                            self.push(RecBuild::kind(kind).cls(p.cls).reg(0, r).target(id));
                            return self.emit_goto(jtarget, next);
                        }
                    }
                }
                self.flush_pending();
                let id = self.label_id(btarget);
                self.push(RecBuild::kind(RecKind::BCond).cond(bc).target(id));
                self.emit_goto(jtarget, next)
            }
        }
    }

    fn emit_goto(&mut self, target: BlkId, next: Option<BlkId>) -> bool {
        if next == Some(target) {
            true
        } else {
            let id = self.label_id(target);
            self.push(RecBuild::kind(RecKind::B).target(id));
            false
        }
    }

    // ── Fusion plumbing (decisions shared with the text path) ───────────

    fn step_ins(&mut self, blk: &Blk, idx: usize) {
        let cur = blk.ins[idx];
        if let Some(p) = self.pending {
            if let Some(fz) = try_fuse(self.cfg, &self.f.cons, &self.layout, blk, idx, &p, &cur) {
                self.pending = None;
                self.emit_fused(&fz);
                return;
            }
            self.pending = None;
            self.emit_ins(&p);
        }
        if candidate(self.cfg, &self.f.cons, &cur) {
            self.pending = Some(cur);
        } else {
            self.emit_ins(&cur);
        }
    }

    fn flush_pending(&mut self) {
        if let Some(p) = self.pending.take() {
            self.emit_ins(&p);
        }
    }

    fn emit_fused(&mut self, fz: &Fused) {
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
                let kind = if float {
                    RecKind::Fmadd
                } else if sub {
                    RecKind::Msub
                } else {
                    RecKind::Madd
                };
                self.push(
                    RecBuild::kind(kind)
                        .cls(cls)
                        .reg(0, to)
                        .reg(1, a)
                        .reg(2, b)
                        .reg(3, acc),
                );
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
                let kind = match alu {
                    Op::Add => RecKind::Add,
                    Op::Sub => RecKind::Sub,
                    Op::And => RecKind::And,
                    Op::Or => RecKind::Orr,
                    Op::Xor => RecKind::Eor,
                    _ => unreachable!(),
                };
                let sh = match shift {
                    Op::Shl => RecShift::Lsl(amount as u8),
                    Op::Shr => RecShift::Lsr(amount as u8),
                    Op::Sar => RecShift::Asr(amount as u8),
                    _ => unreachable!(),
                };
                self.push(
                    RecBuild::kind(kind)
                        .cls(cls)
                        .reg(0, to)
                        .reg(1, other)
                        .reg(2, src)
                        .shift(sh),
                );
            }
            Fused::Pair {
                store,
                cls,
                lo,
                hi,
                off,
            } => {
                let kind = if store { RecKind::Stp } else { RecKind::Ldp };
                self.push(
                    RecBuild::kind(kind)
                        .cls(cls)
                        .reg(0, lo)
                        .reg(1, hi)
                        .reg(2, crate::ir::FP)
                        .imm(0, off),
                );
            }
            Fused::Indexed {
                op,
                cls,
                val,
                base,
                index,
            } => {
                let (kind, vk) = mem_kind(op, cls);
                self.push(
                    RecBuild::kind(kind)
                        .cls(vk)
                        .reg(0, val)
                        .reg(1, base)
                        .reg(2, index),
                );
            }
        }
    }

    // ── Instructions ────────────────────────────────────────────────────

    fn con(&self, ix: u32) -> &Con {
        &self.f.cons[ix as usize]
    }

    fn bits(&self, r: Ref) -> Option<i64> {
        match r {
            Ref::Con(ix) => match self.con(ix) {
                Con::Bits(n) => Some(*n),
                Con::Addr(_) => None,
            },
            _ => None,
        }
    }

    /// ALU operand: either a register in reg slot 2 or an immediate.
    fn alu_rhs(&self, b: RecBuild, r: Ref, k: Cls) -> RecBuild {
        match r {
            Ref::Reg(reg) => b.reg(2, reg),
            Ref::Con(ix) => {
                let n = match self.con(ix) {
                    Con::Bits(n) => *n,
                    Con::Addr(sym) => {
                        panic!("address constant {} used as an ALU operand", sym.name)
                    }
                };
                match classify_alu_imm(n, k) {
                    AluImm::Plain(v) | AluImm::Mask(v) => b.imm(0, v),
                    AluImm::Lsl12(v) => b.imm(0, v).shift(RecShift::Lsl(12)),
                }
            }
            r => panic!("bad ALU operand {:?}", r),
        }
    }

    fn reg_of(&self, r: Ref) -> PhysReg {
        r.as_reg()
            .unwrap_or_else(|| panic!("register required, got {:?}", r))
    }

    fn emit_ins(&mut self, i: &Ins) {
        match i.op {
            Op::Nop => {}
            Op::Copy => self.emit_copy(i),
            Op::Swap => self.emit_swap(i),
            Op::Addr => {
                let d = self.reg_of(i.to);
                let s = match i.arg[0] {
                    Ref::Slot(s) => s,
                    r => panic!("address of {:?}", r),
                };
                let off = self.layout.slot_off(s);
                self.addr_into(d, off);
            }
            Op::SAlloc => self.emit_salloc(i),
            Op::Call => self.emit_call(i),
            Op::VLoadA
            | Op::VLoadB
            | Op::VLoadC
            | Op::VStore
            | Op::VAdd
            | Op::VSub
            | Op::VMul
            | Op::VDiv
            | Op::VFma
            | Op::VSum => self.emit_vector(i),
            _ if i.op.mem_size(i.cls).is_some() => self.emit_mem(i),
            _ => self.emit_alu(i),
        }
    }

    fn emit_alu(&mut self, i: &Ins) {
        let k = i.cls;
        match i.op {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::UDiv | Op::And | Op::Or | Op::Xor
            | Op::Sar | Op::Shr | Op::Shl => {
                // The class tag picks the float form, as it does for the
                // register names in the text output.
                let kind = match i.op {
                    Op::Add => RecKind::Add,
                    Op::Sub => RecKind::Sub,
                    Op::Mul => RecKind::Mul,
                    Op::Div => RecKind::Sdiv,
                    Op::UDiv => RecKind::Udiv,
                    Op::And => RecKind::And,
                    Op::Or => RecKind::Orr,
                    Op::Xor => RecKind::Eor,
                    Op::Sar => RecKind::Asr,
                    Op::Shr => RecKind::Lsr,
                    Op::Shl => RecKind::Lsl,
                    _ => unreachable!(),
                };
                let b = RecBuild::kind(kind)
                    .cls(k)
                    .reg(0, self.reg_of(i.to))
                    .reg(1, self.reg_of(i.arg[0]));
                let b = self.alu_rhs(b, i.arg[1], k);
                self.push(b);
            }
            Op::Neg => {
                self.push(
                    RecBuild::kind(RecKind::Neg)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::Rem | Op::URem => {
                // Two records, mirroring the sdiv/msub template pair.
                let div = if i.op == Op::Rem {
                    RecKind::Sdiv
                } else {
                    RecKind::Udiv
                };
                let (a, b_) = (self.reg_of(i.arg[0]), self.reg_of(i.arg[1]));
                self.push(RecBuild::kind(div).cls(k).reg(0, IP1).reg(1, a).reg(2, b_));
                self.push(
                    RecBuild::kind(RecKind::Msub)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, IP1)
                        .reg(2, b_)
                        .reg(3, a),
                );
            }
            Op::Cmp | Op::Cmn => {
                let kind = if i.op == Op::Cmp {
                    RecKind::Cmp
                } else {
                    RecKind::Cmn
                };
                let b = RecBuild::kind(kind).cls(k).reg(1, self.reg_of(i.arg[0]));
                let b = self.alu_rhs(b, i.arg[1], k);
                self.push(b);
            }
            Op::FCmp => {
                self.push(
                    RecBuild::kind(RecKind::Fcmp)
                        .cls(k)
                        .reg(1, self.reg_of(i.arg[0]))
                        .reg(2, self.reg_of(i.arg[1])),
                );
            }
            Op::Set(c) => {
                self.push(
                    RecBuild::kind(RecKind::Cset)
                        .cls(k)
                        .cond(c)
                        .reg(0, self.reg_of(i.to)),
                );
            }
            Op::ExtSB | Op::ExtUB | Op::ExtSH | Op::ExtUH | Op::ExtSW | Op::ExtUW => {
                let kind = match i.op {
                    Op::ExtSB => RecKind::Sxtb,
                    Op::ExtUB => RecKind::Uxtb,
                    Op::ExtSH => RecKind::Sxth,
                    Op::ExtUH => RecKind::Uxth,
                    Op::ExtSW => RecKind::Sxtw,
                    Op::ExtUW => RecKind::Mov,
                    _ => unreachable!(),
                };
                let kk = if i.op == Op::ExtUW { Cls::W } else { k };
                self.push(
                    RecBuild::kind(kind)
                        .cls(kk)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::ExtS | Op::TruncD => {
                self.push(
                    RecBuild::kind(RecKind::Fcvt)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::StoSI | Op::DtoSI => {
                self.push(
                    RecBuild::kind(RecKind::Fcvtzs)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::StoUI | Op::DtoUI => {
                self.push(
                    RecBuild::kind(RecKind::Fcvtzu)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::SWtoF | Op::SLtoF => {
                self.push(
                    RecBuild::kind(RecKind::Scvtf)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::UWtoF | Op::ULtoF => {
                self.push(
                    RecBuild::kind(RecKind::Ucvtf)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            Op::Cast => {
                self.push(
                    RecBuild::kind(RecKind::Fmov)
                        .cls(k)
                        .reg(0, self.reg_of(i.to))
                        .reg(1, self.reg_of(i.arg[0])),
                );
            }
            op => panic!("no match for {:?}({:?})", op, k),
        }
    }

    // ── Memory ──────────────────────────────────────────────────────────

    fn emit_mem(&mut self, i: &Ins) {
        let size = i.op.mem_size(i.cls).unwrap();
        let mut i = *i;
        let mut scratch = self.target.fixup_scratch.iter().copied();

        let mut value_scratch = None;
        if i.op.is_store() {
            match i.arg[0] {
                Ref::Con(ix) => {
                    let vcls = match i.op {
                        Op::StoreL => Cls::L,
                        Op::StoreD => Cls::D,
                        Op::StoreS => Cls::S,
                        _ => Cls::W,
                    };
                    let n = match self.con(ix) {
                        Con::Bits(n) => *n,
                        Con::Addr(_) => panic!("address store values must be registers"),
                    };
                    if vcls.is_int() {
                        let scr = scratch
                            .next()
                            .unwrap_or_else(|| panic!("no scratch for stored constant"));
                        self.mov_imm(scr, vcls, n);
                        i.arg[0] = Ref::Reg(scr);
                        value_scratch = Some(scr);
                    } else {
                        let wide = if vcls == Cls::D { Cls::L } else { Cls::W };
                        self.mov_imm(IP1, wide, n);
                        self.push(
                            RecBuild::kind(RecKind::Fmov)
                                .cls(vcls)
                                .reg(0, FP_SCRATCH)
                                .reg(1, IP1),
                        );
                        i.arg[0] = Ref::Reg(FP_SCRATCH);
                    }
                }
                Ref::Slot(_) => panic!("stored value must be a register"),
                _ => {}
            }
        }

        let aix = i.op.mem_arg().unwrap();
        match i.arg[aix] {
            Ref::Slot(s) => {
                let off = self.layout.slot_off(s);
                if off > size * 4095 {
                    match scratch.next() {
                        Some(scr) => {
                            self.addr_into(scr, off);
                            i.arg[aix] = Ref::Reg(scr);
                        }
                        None => {
                            let scr =
                                value_scratch.expect("store fixup without a value scratch");
                            let vcls = if size == 8 { Cls::D } else { Cls::S };
                            self.push(
                                RecBuild::kind(RecKind::Fmov)
                                    .cls(vcls)
                                    .reg(0, FP_SCRATCH)
                                    .reg(1, scr),
                            );
                            self.addr_into(scr, off);
                            let kind = match size {
                                1 => RecKind::Strb,
                                2 => RecKind::Strh,
                                _ => RecKind::Str,
                            };
                            self.push(
                                RecBuild::kind(kind)
                                    .cls(vcls)
                                    .reg(0, FP_SCRATCH)
                                    .reg(1, scr),
                            );
                            return;
                        }
                    }
                }
            }
            Ref::Con(ix) => {
                let scr = scratch
                    .next()
                    .unwrap_or_else(|| panic!("no scratch for address constant"));
                match self.con(ix).clone() {
                    Con::Addr(sym) => self.load_sym(scr, &sym),
                    Con::Bits(n) => self.mov_imm(scr, Cls::L, n),
                }
                i.arg[aix] = Ref::Reg(scr);
            }
            Ref::Reg(_) => {}
            Ref::None => panic!("memory instruction {:?} without an address", i.op),
        }

        let (kind, vk) = mem_kind(i.op, i.cls);
        let val = if i.op.is_store() {
            self.reg_of(i.arg[0])
        } else {
            self.reg_of(i.to)
        };
        let b = RecBuild::kind(kind).cls(vk).reg(0, val);
        let b = match i.arg[aix] {
            Ref::Reg(base) => b.reg(1, base),
            Ref::Slot(s) => b.reg(1, crate::ir::FP).imm(0, self.layout.slot_off(s)),
            _ => unreachable!(),
        };
        self.push(b);
    }

    fn addr_into(&mut self, scr: PhysReg, off: i64) {
        if off <= 4095 {
            self.push(
                RecBuild::kind(RecKind::Add)
                    .cls(Cls::L)
                    .reg(0, scr)
                    .reg(1, crate::ir::FP)
                    .imm(0, off),
            );
        } else {
            self.mov_imm(scr, Cls::L, off);
            self.push(
                RecBuild::kind(RecKind::Add)
                    .cls(Cls::L)
                    .reg(0, scr)
                    .reg(1, crate::ir::FP)
                    .reg(2, scr),
            );
        }
    }

    // ── Open-coded opcodes ──────────────────────────────────────────────

    fn emit_copy(&mut self, i: &Ins) {
        let k = i.cls;
        match (i.to, i.arg[0]) {
            (Ref::Reg(d), Ref::Reg(s)) => {
                if d != s {
                    let kind = if k.is_int() { RecKind::Mov } else { RecKind::Fmov };
                    self.push(RecBuild::kind(kind).cls(k).reg(0, d).reg(1, s));
                }
            }
            (Ref::Reg(d), Ref::Con(ix)) => match self.con(ix).clone() {
                Con::Bits(n) => {
                    if k.is_int() {
                        self.mov_imm(d, k, n);
                    } else {
                        let wide = if k == Cls::D { Cls::L } else { Cls::W };
                        self.mov_imm(IP1, wide, n);
                        self.push(RecBuild::kind(RecKind::Fmov).cls(k).reg(0, d).reg(1, IP1));
                    }
                }
                Con::Addr(sym) => self.load_sym(d, &sym),
            },
            (Ref::Reg(_), Ref::Slot(s)) => {
                let ld = Ins::new(Op::Load, k, i.to, [Ref::Slot(s), Ref::None]);
                self.emit_mem(&ld);
            }
            (Ref::Slot(s), src @ (Ref::Reg(_) | Ref::Con(_))) => {
                let op = match k {
                    Cls::W => Op::StoreW,
                    Cls::L => Op::StoreL,
                    Cls::S => Op::StoreS,
                    Cls::D => Op::StoreD,
                };
                let st = Ins::new(op, k, Ref::None, [src, Ref::Slot(s)]);
                self.emit_mem(&st);
            }
            (Ref::None, _) => {}
            (to, from) => panic!("bad copy {:?} <- {:?}", to, from),
        }
    }

    fn emit_swap(&mut self, i: &Ins) {
        let k = i.cls;
        let a = self.reg_of(i.arg[0]);
        let b = self.reg_of(i.arg[1]);
        let scr = if k.is_int() { IP1 } else { FP_SCRATCH };
        let kind = if k.is_int() { RecKind::Mov } else { RecKind::Fmov };
        self.push(RecBuild::kind(kind).cls(k).reg(0, scr).reg(1, a));
        self.push(RecBuild::kind(kind).cls(k).reg(0, a).reg(1, b));
        self.push(RecBuild::kind(kind).cls(k).reg(0, b).reg(1, scr));
    }

    fn emit_salloc(&mut self, i: &Ins) {
        let sp = crate::ir::SP;
        match i.arg[0] {
            Ref::Con(ix) => {
                let n = match self.con(ix) {
                    Con::Bits(n) => *n,
                    Con::Addr(_) => panic!("stack allocation by an address"),
                };
                if n <= 4095 {
                    self.push(
                        RecBuild::kind(RecKind::Sub)
                            .cls(Cls::L)
                            .reg(0, sp)
                            .reg(1, sp)
                            .imm(0, n),
                    );
                } else {
                    self.mov_imm(IP1, Cls::L, n);
                    self.push(
                        RecBuild::kind(RecKind::Sub)
                            .cls(Cls::L)
                            .reg(0, sp)
                            .reg(1, sp)
                            .reg(2, IP1),
                    );
                }
            }
            Ref::Reg(r) => {
                self.push(
                    RecBuild::kind(RecKind::Sub)
                        .cls(Cls::L)
                        .reg(0, sp)
                        .reg(1, sp)
                        .reg(2, r),
                );
            }
            r => panic!("stack allocation by {:?}", r),
        }
        if let Ref::Reg(d) = i.to {
            self.push(RecBuild::kind(RecKind::Mov).cls(Cls::L).reg(0, d).reg(1, sp));
        }
    }

    fn emit_call(&mut self, i: &Ins) {
        match i.arg[0] {
            Ref::Con(ix) => {
                let sym = match self.con(ix) {
                    Con::Addr(sym) => sym.clone(),
                    c => panic!("call of {:?}", c),
                };
                assert!(sym.addend == 0, "call of {} with addend", sym.name);
                let name = self.target.symbol(&sym.name);
                self.push(RecBuild::kind(RecKind::Bl).sym(&name));
            }
            Ref::Reg(r) => {
                self.push(RecBuild::kind(RecKind::Blr).reg(0, r));
            }
            r => panic!("call of {:?}", r),
        }
    }

    /// The `adrp`/`add` or thread-local sequence for a symbol address.
    fn load_sym(&mut self, d: PhysReg, sym: &Sym) {
        let mut name = self.target.symbol(&sym.name);
        if sym.addend != 0 {
            if sym.addend > 0 {
                name.push('+');
            }
            name.push_str(&sym.addend.to_string());
        }
        match sym.kind {
            SymKind::Global => {
                self.push(RecBuild::kind(RecKind::Adrp).reg(0, d).sym(&name));
                self.push(
                    RecBuild::kind(RecKind::AddPageOff)
                        .reg(0, d)
                        .reg(1, d)
                        .sym(&name),
                );
            }
            SymKind::ThreadLocal => {
                if self.target.apple {
                    self.push(RecBuild::kind(RecKind::Adrp).reg(0, d).sym(&name));
                    self.push(
                        RecBuild::kind(RecKind::LdrTlvp)
                            .reg(0, d)
                            .reg(1, d)
                            .sym(&name),
                    );
                } else {
                    self.push(RecBuild::kind(RecKind::MrsTp).reg(0, d));
                    self.push(
                        RecBuild::kind(RecKind::AddTprelHi)
                            .reg(0, d)
                            .reg(1, d)
                            .sym(&name),
                    );
                    self.push(
                        RecBuild::kind(RecKind::AddTprelLo)
                            .reg(0, d)
                            .reg(1, d)
                            .sym(&name),
                    );
                }
            }
        }
    }

    // ── Vector ──────────────────────────────────────────────────────────

    fn varr(&self, i: &Ins) -> VArr {
        let bits = self
            .bits(i.arg[0])
            .unwrap_or_else(|| panic!("vector op {:?} without an arrangement", i.op));
        VArr::from_bits(bits)
            .unwrap_or_else(|| panic!("bad vector arrangement {} for {:?}", bits, i.op))
    }

    fn vector_mem(&mut self, kind: RecKind, vr: PhysReg, addr: Ref, arr: VArr) {
        let b = RecBuild::kind(kind).reg(0, vr).imm(1, arr as i64);
        match addr {
            Ref::Reg(r) => self.push(b.reg(1, r)),
            Ref::Slot(s) => {
                let off = self.layout.slot_off(s);
                if off % 16 == 0 && off <= 16 * 4095 {
                    self.push(b.reg(1, crate::ir::FP).imm(0, off));
                } else {
                    let scr = self.target.fixup_scratch[0];
                    self.addr_into(scr, off);
                    self.push(b.reg(1, scr));
                }
            }
            r => panic!("bad vector address {:?}", r),
        }
    }

    fn emit_vector(&mut self, i: &Ins) {
        let arr = self.varr(i);
        let v28 = crate::ir::vreg(28);
        let v29 = crate::ir::vreg(29);
        let v30 = crate::ir::vreg(30);
        let v31 = FP_SCRATCH;
        let varith = |kind: RecKind| {
            RecBuild::kind(kind)
                .reg(0, v28)
                .reg(1, v28)
                .reg(2, v29)
                .imm(1, arr as i64)
        };
        match i.op {
            Op::VLoadA => self.vector_mem(RecKind::LdrQ, v28, i.arg[1], arr),
            Op::VLoadB => self.vector_mem(RecKind::LdrQ, v29, i.arg[1], arr),
            Op::VLoadC => self.vector_mem(RecKind::LdrQ, v30, i.arg[1], arr),
            Op::VStore => self.vector_mem(RecKind::StrQ, v28, i.arg[1], arr),
            Op::VAdd => self.push(varith(RecKind::Vadd)),
            Op::VSub => self.push(varith(RecKind::Vsub)),
            Op::VMul => {
                if !arr.is_float() && arr == VArr::I2D {
                    panic!("no integer vector multiply at .2d");
                }
                self.push(varith(RecKind::Vmul));
            }
            Op::VDiv => {
                if !arr.is_float() {
                    panic!("no integer vector divide");
                }
                self.push(varith(RecKind::Vdiv));
            }
            Op::VFma => {
                if !arr.is_float() && arr == VArr::I2D {
                    panic!("no integer vector multiply-add at .2d");
                }
                self.push(
                    RecBuild::kind(RecKind::Vmla)
                        .reg(0, v28)
                        .reg(1, v29)
                        .reg(2, v30)
                        .imm(1, arr as i64),
                );
            }
            Op::VSum => {
                let d = self.reg_of(i.to);
                match arr {
                    VArr::I4S | VArr::I8H | VArr::I16B => {
                        self.push(
                            RecBuild::kind(RecKind::Vaddv)
                                .reg(0, v31)
                                .reg(1, v28)
                                .imm(1, arr as i64),
                        );
                        if arr == VArr::I4S {
                            self.push(
                                RecBuild::kind(RecKind::Fmov).cls(Cls::W).reg(0, d).reg(1, v31),
                            );
                        } else {
                            self.push(
                                RecBuild::kind(RecKind::Vsmov)
                                    .cls(Cls::W)
                                    .reg(0, d)
                                    .reg(1, v31)
                                    .imm(1, arr as i64),
                            );
                        }
                    }
                    VArr::I2D => {
                        self.push(
                            RecBuild::kind(RecKind::Vaddp)
                                .reg(0, v31)
                                .reg(1, v28)
                                .imm(1, arr as i64),
                        );
                        self.push(RecBuild::kind(RecKind::Fmov).cls(Cls::L).reg(0, d).reg(1, v31));
                    }
                    VArr::F4S => {
                        // Two faddp steps; there is no faddv.
                        self.push(
                            RecBuild::kind(RecKind::Vfaddp)
                                .reg(0, v31)
                                .reg(1, v28)
                                .reg(2, v28)
                                .imm(1, arr as i64),
                        );
                        self.push(
                            RecBuild::kind(RecKind::Vfaddp).reg(0, v31).reg(1, v31).imm(1, arr as i64),
                        );
                        self.push(RecBuild::kind(RecKind::Fmov).cls(Cls::S).reg(0, d).reg(1, v31));
                    }
                    VArr::F2D => {
                        self.push(
                            RecBuild::kind(RecKind::Vfaddp)
                                .reg(0, v31)
                                .reg(1, v28)
                                .imm(1, arr as i64),
                        );
                        self.push(RecBuild::kind(RecKind::Fmov).cls(Cls::D).reg(0, d).reg(1, v31));
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}

/// Record kind and value class of a memory opcode.
fn mem_kind(op: Op, cls: Cls) -> (RecKind, Cls) {
    match op {
        Op::Load => (RecKind::Ldr, cls),
        Op::LoadSW => {
            if cls == Cls::L {
                (RecKind::Ldrsw, Cls::L)
            } else {
                (RecKind::Ldr, Cls::W)
            }
        }
        Op::LoadUW => (RecKind::Ldr, Cls::W),
        Op::LoadSH => (RecKind::Ldrsh, cls),
        Op::LoadUH => (RecKind::Ldrh, Cls::W),
        Op::LoadSB => (RecKind::Ldrsb, cls),
        Op::LoadUB => (RecKind::Ldrb, Cls::W),
        Op::StoreL => (RecKind::Str, Cls::L),
        Op::StoreW => (RecKind::Str, Cls::W),
        Op::StoreH => (RecKind::Strh, Cls::W),
        Op::StoreB => (RecKind::Strb, Cls::W),
        Op::StoreD => (RecKind::Str, Cls::D),
        Op::StoreS => (RecKind::Str, Cls::S),
        _ => panic!("{:?} is not a memory opcode", op),
    }
}
