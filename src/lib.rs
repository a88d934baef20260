//! Ovum — the runtime for a dynamically-typed object language.
//!
//! The crate is organized around the life of a method body:
//!
//! - [`bytecode`] — the compact, token-based source instruction set loaded
//!   from modules, and the operand-resolved internal instruction set the
//!   interpreter actually executes.
//! - [`method`] — the initialization pipeline that turns the former into the
//!   latter: parse, stack-height analysis, redundant-move folding, emission.
//! - [`runtime`] — the registries the instruction stream refers to: types,
//!   method groups, fields, modules and their token tables.
//! - [`vm`] — the interpreter thread, stack frames, exception handling and
//!   the stack-trace formatter.
//! - [`gc`] — the object heap, the string-intern table, the root-set walker
//!   and the safepoint protocol the interpreter cooperates with.

pub mod bytecode;
pub mod gc;
pub mod method;
pub mod runtime;
pub mod vm;

pub mod prelude {
    pub use ovum_core::{
        FieldId, MethodId, ModuleId, ObjHandle, StaticId, Token, TokenKind, TypeId, Value,
        exit_code,
    };
    pub use ovum_core::{MethodInitError, MethodInitErrorKind, VmError};

    pub use crate::bytecode::opcode::Opcode;
    pub use crate::runtime::builder::VmBuilder;
    pub use crate::vm::{Abort, Thread, Vm};
}
