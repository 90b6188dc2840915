//! AArch64 code generation for a register-allocated SSA intermediate
//! representation.
//!
//! The crate takes a function that has already been through the
//! optimization pipeline and the register allocator and turns it into
//! GNU-assembler AArch64 text, or alternatively into a flat array of
//! structured instruction records for an in-memory encoder. Parsing,
//! optimization, register allocation, data emission, and tool invocation
//! all live upstream; this crate only consumes their results.

pub mod backend;
pub mod ir;
