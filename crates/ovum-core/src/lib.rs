//! Core data model for the Ovum runtime.
//!
//! This crate holds the leaf types shared by every part of the runtime:
//! typed handles, the [`Value`] representation, the error hierarchy, process
//! exit codes, and reference signatures. It deliberately knows nothing about
//! the interpreter, the GC or the module registries; those live in the
//! `ovum` crate and depend on this one.

pub mod error;
pub mod ids;
pub mod refsig;
pub mod value;

pub use error::{MethodInitError, MethodInitErrorKind, VmError, exit_code};
pub use ids::{FieldId, MethodId, ModuleId, ObjHandle, StaticId, StrId, Token, TokenKind, TypeId};
pub use refsig::{RefSignature, RefSignatureBuilder, RefSignaturePool};
pub use value::Value;
