//! Table-driven instruction selection.
//!
//! Most opcodes map through a static table of format templates. The
//! directives are `%=` (destination), `%0`/`%1` (arguments), `%W %L %S
//! %D` (class override for the next operand), `%?` (the class scratch),
//! and `%M<n>` (the memory operand of argument n). The first row whose
//! opcode matches and whose filter admits the class wins; a miss means
//! the IR is ill-typed for this target.
//!
//! Copies, swaps, slot addresses, calls, and stack allocation have
//! open-coded rules instead of table rows.

use std::io;

use crate::ir::{Cls, Con, Cond, Ins, Op, Ref, IP1};

use super::emit::Arm64Codegen;
use super::operand_helpers::rname;

#[derive(Clone, Copy)]
enum ClsF {
    Exact(Cls),
    Int,
    Any,
}

impl ClsF {
    fn admits(self, k: Cls) -> bool {
        match self {
            ClsF::Exact(c) => c == k,
            ClsF::Int => k.is_int(),
            ClsF::Any => true,
        }
    }
}

use ClsF::{Any, Exact, Int};

#[rustfmt::skip]
static OMAP: &[(Op, ClsF, &str)] = &[
    (Op::Add,    Int,            "add %=, %0, %1"),
    (Op::Add,    Any,            "fadd %=, %0, %1"),
    (Op::Sub,    Int,            "sub %=, %0, %1"),
    (Op::Sub,    Any,            "fsub %=, %0, %1"),
    (Op::Neg,    Int,            "neg %=, %0"),
    (Op::Neg,    Any,            "fneg %=, %0"),
    (Op::And,    Int,            "and %=, %0, %1"),
    (Op::Or,     Int,            "orr %=, %0, %1"),
    (Op::Xor,    Int,            "eor %=, %0, %1"),
    (Op::Sar,    Int,            "asr %=, %0, %1"),
    (Op::Shr,    Int,            "lsr %=, %0, %1"),
    (Op::Shl,    Int,            "lsl %=, %0, %1"),
    (Op::Mul,    Int,            "mul %=, %0, %1"),
    (Op::Mul,    Any,            "fmul %=, %0, %1"),
    (Op::Div,    Int,            "sdiv %=, %0, %1"),
    (Op::Div,    Any,            "fdiv %=, %0, %1"),
    (Op::UDiv,   Int,            "udiv %=, %0, %1"),
    (Op::Rem,    Int,            "sdiv %?, %0, %1\nmsub %=, %?, %1, %0"),
    (Op::URem,   Int,            "udiv %?, %0, %1\nmsub %=, %?, %1, %0"),
    (Op::Load,   Any,            "ldr %=, %M0"),
    (Op::LoadSW, Exact(Cls::W),  "ldr %=, %M0"),
    (Op::LoadSW, Exact(Cls::L),  "ldrsw %=, %M0"),
    (Op::LoadUW, Int,            "ldr %W=, %M0"),
    (Op::LoadSH, Int,            "ldrsh %=, %M0"),
    (Op::LoadUH, Int,            "ldrh %W=, %M0"),
    (Op::LoadSB, Int,            "ldrsb %=, %M0"),
    (Op::LoadUB, Int,            "ldrb %W=, %M0"),
    (Op::StoreL, Any,            "str %L0, %M1"),
    (Op::StoreW, Any,            "str %W0, %M1"),
    (Op::StoreH, Any,            "strh %W0, %M1"),
    (Op::StoreB, Any,            "strb %W0, %M1"),
    (Op::StoreD, Any,            "str %D0, %M1"),
    (Op::StoreS, Any,            "str %S0, %M1"),
    (Op::Cmp,    Int,            "cmp %0, %1"),
    (Op::Cmn,    Int,            "cmn %0, %1"),
    (Op::FCmp,   Any,            "fcmpe %0, %1"),
    (Op::Set(Cond::Eq), Int,     "cset %=, eq"),
    (Op::Set(Cond::Ne), Int,     "cset %=, ne"),
    (Op::Set(Cond::Hs), Int,     "cset %=, hs"),
    (Op::Set(Cond::Lo), Int,     "cset %=, lo"),
    (Op::Set(Cond::Mi), Int,     "cset %=, mi"),
    (Op::Set(Cond::Pl), Int,     "cset %=, pl"),
    (Op::Set(Cond::Vs), Int,     "cset %=, vs"),
    (Op::Set(Cond::Vc), Int,     "cset %=, vc"),
    (Op::Set(Cond::Hi), Int,     "cset %=, hi"),
    (Op::Set(Cond::Ls), Int,     "cset %=, ls"),
    (Op::Set(Cond::Ge), Int,     "cset %=, ge"),
    (Op::Set(Cond::Lt), Int,     "cset %=, lt"),
    (Op::Set(Cond::Gt), Int,     "cset %=, gt"),
    (Op::Set(Cond::Le), Int,     "cset %=, le"),
    (Op::ExtSB,  Int,            "sxtb %=, %W0"),
    (Op::ExtUB,  Int,            "uxtb %W=, %W0"),
    (Op::ExtSH,  Int,            "sxth %=, %W0"),
    (Op::ExtUH,  Int,            "uxth %W=, %W0"),
    (Op::ExtSW,  Exact(Cls::L),  "sxtw %=, %W0"),
    (Op::ExtUW,  Exact(Cls::L),  "mov %W=, %W0"),
    (Op::ExtS,   Exact(Cls::D),  "fcvt %=, %S0"),
    (Op::TruncD, Exact(Cls::S),  "fcvt %=, %D0"),
    (Op::StoSI,  Int,            "fcvtzs %=, %S0"),
    (Op::StoUI,  Int,            "fcvtzu %=, %S0"),
    (Op::DtoSI,  Int,            "fcvtzs %=, %D0"),
    (Op::DtoUI,  Int,            "fcvtzu %=, %D0"),
    (Op::SWtoF,  Any,            "scvtf %=, %W0"),
    (Op::UWtoF,  Any,            "ucvtf %=, %W0"),
    (Op::SLtoF,  Any,            "scvtf %=, %L0"),
    (Op::ULtoF,  Any,            "ucvtf %=, %L0"),
    (Op::Cast,   Exact(Cls::W),  "fmov %=, %S0"),
    (Op::Cast,   Exact(Cls::L),  "fmov %=, %D0"),
    (Op::Cast,   Exact(Cls::S),  "fmov %=, %W0"),
    (Op::Cast,   Exact(Cls::D),  "fmov %=, %L0"),
];

fn sel_fmt(op: Op, k: Cls) -> &'static str {
    for &(o, f, fmt) in OMAP {
        if o == op && f.admits(k) {
            return fmt;
        }
    }
    panic!("no match for {:?}({:?})", op, k);
}

/// The class scratch: x17 for integers, V31 for floats.
fn scratch_name(k: Cls) -> String {
    match k {
        Cls::W | Cls::L => rname(IP1, k),
        Cls::S => "s31".to_string(),
        Cls::D => "d31".to_string(),
    }
}

/// Mnemonic and value class of a memory instruction, for the fused
/// register-offset forms.
pub(super) fn mem_mnemonic(op: Op, cls: Cls) -> (&'static str, Cls) {
    match op {
        Op::Load => ("ldr", cls),
        Op::LoadSW => {
            if cls == Cls::L {
                ("ldrsw", Cls::L)
            } else {
                ("ldr", Cls::W)
            }
        }
        Op::LoadUW => ("ldr", Cls::W),
        Op::LoadSH => ("ldrsh", cls),
        Op::LoadUH => ("ldrh", Cls::W),
        Op::LoadSB => ("ldrsb", cls),
        Op::LoadUB => ("ldrb", Cls::W),
        Op::StoreL => ("str", Cls::L),
        Op::StoreW => ("str", Cls::W),
        Op::StoreH => ("strh", Cls::W),
        Op::StoreB => ("strb", Cls::W),
        Op::StoreD => ("str", Cls::D),
        Op::StoreS => ("str", Cls::S),
        _ => panic!("{:?} is not a memory opcode", op),
    }
}

impl<'a> Arm64Codegen<'a> {
    /// Emit one instruction, fusion aside.
    pub(super) fn emit_ins(&mut self, i: &Ins) -> io::Result<()> {
        match i.op {
            Op::Nop => Ok(()),
            Op::Copy => self.emit_copy(i),
            Op::Swap => self.emit_swap(i),
            Op::Addr => self.emit_addr_of(i),
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
            _ => {
                if i.op.mem_size(i.cls).is_some() {
                    match self.fixup_mem(i)? {
                        Some(fixed) => self.emit_table_ins(&fixed),
                        None => Ok(()),
                    }
                } else {
                    self.emit_table_ins(i)
                }
            }
        }
    }

    /// Render a table template against an instruction.
    pub(super) fn emit_table_ins(&mut self, i: &Ins) -> io::Result<()> {
        let fmt = sel_fmt(i.op, i.cls);
        let mut line = String::with_capacity(48);
        line.push_str("    ");
        let bytes = fmt.as_bytes();
        let mut p = 0;
        while p < bytes.len() {
            let c = bytes[p] as char;
            p += 1;
            if c == '\n' {
                line.push('\n');
                line.push_str("    ");
                continue;
            }
            if c != '%' {
                line.push(c);
                continue;
            }
            let mut k = i.cls;
            let mut d = bytes[p] as char;
            p += 1;
            if let Some(over) = match d {
                'W' => Some(Cls::W),
                'L' => Some(Cls::L),
                'S' => Some(Cls::S),
                'D' => Some(Cls::D),
                _ => None,
            } {
                k = over;
                d = bytes[p] as char;
                p += 1;
            }
            match d {
                '=' => line.push_str(&self.operand(i.to, k)),
                '0' => line.push_str(&self.operand(i.arg[0], k)),
                '1' => line.push_str(&self.operand(i.arg[1], k)),
                '?' => line.push_str(&scratch_name(k)),
                'M' => {
                    let n = (bytes[p] as char)
                        .to_digit(10)
                        .unwrap_or_else(|| panic!("bad %M directive in {:?}", fmt));
                    p += 1;
                    line.push_str(&self.mem_operand(i.arg[n as usize]));
                }
                _ => panic!("bad directive %{} in {:?}", d, fmt),
            }
        }
        self.emitf(format_args!("{}", line))
    }

    fn emit_copy(&mut self, i: &Ins) -> io::Result<()> {
        let k = i.cls;
        match (i.to, i.arg[0]) {
            (Ref::Reg(d), Ref::Reg(s)) => {
                if d == s {
                    return Ok(());
                }
                let m = if k.is_int() { "mov" } else { "fmov" };
                let (dn, sn) = (rname(d, k), rname(s, k));
                self.emitf(format_args!("    {} {}, {}", m, dn, sn))
            }
            (Ref::Reg(d), Ref::Con(ix)) => self.loadcon(ix, d, k),
            (Ref::Reg(d), Ref::Slot(s)) => {
                let ld = Ins::new(Op::Load, k, Ref::Reg(d), [Ref::Slot(s), Ref::None]);
                match self.fixup_mem(&ld)? {
                    Some(fixed) => self.emit_table_ins(&fixed),
                    None => Ok(()),
                }
            }
            (Ref::Slot(s), src @ (Ref::Reg(_) | Ref::Con(_))) => {
                let op = match k {
                    Cls::W => Op::StoreW,
                    Cls::L => Op::StoreL,
                    Cls::S => Op::StoreS,
                    Cls::D => Op::StoreD,
                };
                let st = Ins::new(op, k, Ref::None, [src, Ref::Slot(s)]);
                match self.fixup_mem(&st)? {
                    Some(fixed) => self.emit_table_ins(&fixed),
                    None => Ok(()),
                }
            }
            (Ref::None, _) => Ok(()),
            (to, from) => panic!("bad copy {:?} <- {:?}", to, from),
        }
    }

    fn emit_swap(&mut self, i: &Ins) -> io::Result<()> {
        let k = i.cls;
        let a = rname(
            i.arg[0].as_reg().unwrap_or_else(|| panic!("swap of {:?}", i.arg[0])),
            k,
        );
        let b = rname(
            i.arg[1].as_reg().unwrap_or_else(|| panic!("swap of {:?}", i.arg[1])),
            k,
        );
        let scr = scratch_name(k);
        let m = if k.is_int() { "mov" } else { "fmov" };
        self.emitf(format_args!("    {} {}, {}", m, scr, a))?;
        self.emitf(format_args!("    {} {}, {}", m, a, b))?;
        self.emitf(format_args!("    {} {}, {}", m, b, scr))
    }

    fn emit_addr_of(&mut self, i: &Ins) -> io::Result<()> {
        let d = i
            .to
            .as_reg()
            .unwrap_or_else(|| panic!("address into {:?}", i.to));
        let s = match i.arg[0] {
            Ref::Slot(s) => s,
            r => panic!("address of {:?}", r),
        };
        let off = self.layout.slot_off(s);
        self.addr_into(d, off)
    }

    fn emit_salloc(&mut self, i: &Ins) -> io::Result<()> {
        match i.arg[0] {
            Ref::Con(ix) => match &self.f.cons[ix as usize] {
                Con::Bits(n) => {
                    let n = *n;
                    if n <= 4095 {
                        self.emitf(format_args!("    sub sp, sp, #{}", n))?;
                    } else {
                        let scr = scratch_name(Cls::L);
                        self.emit_con_bits(n, &scr, Cls::L)?;
                        self.emitf(format_args!("    sub sp, sp, {}", scr))?;
                    }
                }
                Con::Addr(_) => panic!("stack allocation by an address"),
            },
            Ref::Reg(r) => {
                let rn = rname(r, Cls::L);
                self.emitf(format_args!("    sub sp, sp, {}", rn))?;
            }
            r => panic!("stack allocation by {:?}", r),
        }
        if let Ref::Reg(d) = i.to {
            let dn = rname(d, Cls::L);
            self.emitf(format_args!("    mov {}, sp", dn))?;
        }
        Ok(())
    }

    fn emit_call(&mut self, i: &Ins) -> io::Result<()> {
        match i.arg[0] {
            Ref::Con(ix) => {
                let sym = match &self.f.cons[ix as usize] {
                    Con::Addr(sym) => sym,
                    c => panic!("call of {:?}", c),
                };
                assert!(sym.addend == 0, "call of {} with addend", sym.name);
                let name = self.target.symbol(&sym.name);
                self.emitf(format_args!("    bl {}", name))
            }
            Ref::Reg(r) => {
                let rn = rname(r, Cls::L);
                self.emitf(format_args!("    blr {}", rn))
            }
            r => panic!("call of {:?}", r),
        }
    }
}
