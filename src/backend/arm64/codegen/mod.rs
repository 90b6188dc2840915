pub(crate) mod emit;

mod const_helpers;
mod frame_helpers;
mod fusion;
mod neon_helpers;
mod operand_helpers;
mod select;
mod slot_helpers;

pub use emit::{emit_function, Unit};
pub(crate) use const_helpers::{con_sequence, ConSeq};
pub(crate) use frame_helpers::FrameLayout;
pub(crate) use fusion::{candidate, cmp_zero, try_fuse, Fused};
pub(crate) use operand_helpers::{classify_alu_imm, AluImm};
