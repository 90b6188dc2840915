//! Target descriptors and the AArch64 backend.

pub mod arm64;

use std::io;

use thiserror::Error;

use crate::ir::{IrError, Lnk, PhysReg};

/// Errors surfaced to the caller. Ill-typed IR discovered mid-emission is
/// a compiler bug and aborts with a diagnostic instead of returning here.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ir(#[from] IrError),
}

pub type EmitResult<T> = Result<T, EmitError>;

/// Platform conventions for assembly output. The platform-specific
/// assembly fragments live here as data so the emission paths stay free
/// of per-platform conditionals.
pub struct Target {
    pub name: &'static str,
    pub apple: bool,
    /// Prefix prepended to external symbol names.
    pub assym: &'static str,
    /// Prefix for compilation-unit-local labels.
    pub asloc: &'static str,
    /// Callee-save registers in save order.
    pub calleesave: &'static [PhysReg],
    /// Scratch registers available for slot-address fixups, in
    /// allocation order.
    pub fixup_scratch: &'static [PhysReg],
    /// Relocation decoration for `adrp`: printed after the symbol.
    pub pageref: &'static str,
    /// Relocation decoration for the low-12-bits `add`: printed before
    /// and after the symbol.
    pub pageoff: (&'static str, &'static str),
    /// Function-linkage emission hook: section, visibility, alignment,
    /// and the entry label.
    pub emitlnk: fn(&Target, &str, &Lnk, &mut dyn io::Write) -> io::Result<()>,
}

impl Target {
    /// The symbol name as printed: a leading `"` suppresses the platform
    /// prefix.
    pub fn symbol(&self, name: &str) -> String {
        match name.strip_prefix('"') {
            Some(bare) => bare.to_string(),
            None => format!("{}{}", self.assym, name),
        }
    }

    pub fn emit_fn_header(
        &self,
        name: &str,
        lnk: &Lnk,
        out: &mut dyn io::Write,
    ) -> io::Result<()> {
        (self.emitlnk)(self, name, lnk, out)
    }

    /// ELF functions get the trailing type/size directives; Mach-O has
    /// no equivalent.
    pub fn emit_fn_footer(&self, name: &str, out: &mut dyn io::Write) -> io::Result<()> {
        if self.apple {
            return Ok(());
        }
        let sym = self.symbol(name);
        writeln!(out, ".type {}, @function", sym)?;
        writeln!(out, ".size {}, .-{}", sym, sym)
    }
}

fn emitlnk_common(t: &Target, name: &str, lnk: &Lnk, out: &mut dyn io::Write) -> io::Result<()> {
    let sym = t.symbol(name);
    writeln!(out, ".text")?;
    if let Some(align) = lnk.align {
        writeln!(out, ".balign {}", align)?;
    }
    if lnk.export {
        writeln!(out, ".globl {}", sym)?;
    }
    writeln!(out, "{}:", sym)
}

use crate::ir::{vreg, PhysReg as R};

const CALLEE_SAVE: &[PhysReg] = &[
    R(19),
    R(20),
    R(21),
    R(22),
    R(23),
    R(24),
    R(25),
    R(26),
    R(27),
    R(28),
    vreg(8),
    vreg(9),
    vreg(10),
    vreg(11),
    vreg(12),
    vreg(13),
    vreg(14),
    vreg(15),
];

/// AArch64 ELF (SysV) target.
pub static T_ARM64_ELF: Target = Target {
    name: "arm64",
    apple: false,
    assym: "",
    asloc: ".L",
    calleesave: CALLEE_SAVE,
    fixup_scratch: &[crate::ir::IP0, crate::ir::PLATFORM],
    pageref: "",
    pageoff: ("#:lo12:", ""),
    emitlnk: emitlnk_common,
};

/// AArch64 Apple Mach-O target. x18 is reserved, external symbols are
/// underscore-prefixed, and page relocations use the `@page` spelling.
pub static T_ARM64_APPLE: Target = Target {
    name: "arm64_apple",
    apple: true,
    assym: "_",
    asloc: "L",
    calleesave: CALLEE_SAVE,
    fixup_scratch: &[crate::ir::IP0],
    pageref: "@page",
    pageoff: ("", "@pageoff"),
    emitlnk: emitlnk_common,
};
