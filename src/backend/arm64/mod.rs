//! The AArch64 code generator.

pub mod codegen;
pub mod flags;
pub mod stream;

pub use codegen::{emit_function, Unit};
pub use flags::EmitCfg;
