//! Source and internal instruction sets.
//!
//! Module files carry the compact, token-based [`opcode::Opcode`] stream.
//! Method initialization rewrites it into the operand-resolved
//! [`internal::InternalOp`] stream that the interpreter executes; see the
//! `method` module for the rewriter itself.

pub mod internal;
pub mod opcode;

pub use internal::{InternalOp, LocalOffset};
pub use opcode::Opcode;
