//! Error types crossing the core's boundary.
//!
//! Two kinds of failure leave the execution engine:
//!
//! - [`MethodInitError`] — raised by the method parser and verifier while a
//!   method is being rewritten for execution. These never become managed
//!   errors; the VM shell converts them into a process-level failure.
//! - Managed errors thrown by running code — carried as values of the
//!   runtime's `Error` type, not as Rust errors; see the interpreter.
//!
//! [`VmError`] covers the catastrophic conditions (out of memory, stack
//! exhaustion) that are reported alongside them.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Process exit codes, as surfaced by the VM shell.
pub mod exit_code {
    /// Normal termination.
    pub const SUCCESS: i32 = 0;
    /// A managed error was thrown and never caught.
    pub const ERROR_THROWN: i32 = 1;
    /// A method failed verification during initialization.
    pub const METHOD_INIT_FAILED: i32 = 3;
    /// The runtime ran out of memory.
    pub const OUT_OF_MEMORY: i32 = 4;
    /// Unrecoverable arithmetic overflow.
    pub const ARITHMETIC_OVERFLOW: i32 = 8;
    /// Unrecoverable integer division by zero.
    pub const DIVIDE_BY_ZERO: i32 = 9;
    /// The thread was interrupted.
    pub const THREAD_INTERRUPTED: i32 = 10;
    /// An operation was attempted on the wrong thread.
    pub const WRONG_THREAD: i32 = 11;
    /// Sentinel used internally by synchronization primitives. Never
    /// surfaced as an actual process exit code.
    pub const RESOURCE_BUSY: i32 = 125;
}

/// What went wrong during method initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodInitErrorKind {
    /// No extra information beyond the message.
    General,
    /// An instruction is reached with different stack heights on different
    /// control-flow paths.
    InconsistentStack,
    /// A branch, switch target or protected-region bound does not name a
    /// valid instruction boundary.
    InvalidBranchOffset,
    /// An instruction pops more values than the stack holds, or the method
    /// ends with values left on the stack.
    InsufficientStackHeight,
    /// A reference was about to be stored in a local or static slot.
    StackHasRefs,
    /// A member token resolved to a member the initializing method cannot
    /// access.
    InaccessibleMember,
    /// A field token was used with the wrong staticness.
    FieldStaticMismatch,
    /// A token does not exist in the module's tables.
    UnresolvedTokenId,
    /// A method group has no overload accepting the given argument count.
    NoMatchingOverload,
    /// A type token resolved to a type the initializing method cannot access.
    InaccessibleType,
    /// `newobj` was applied to a type that cannot be constructed.
    TypeNotConstructible,
}

impl MethodInitErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MethodInitErrorKind::General => "general failure",
            MethodInitErrorKind::InconsistentStack => "inconsistent stack height",
            MethodInitErrorKind::InvalidBranchOffset => "invalid branch offset",
            MethodInitErrorKind::InsufficientStackHeight => "insufficient stack height",
            MethodInitErrorKind::StackHasRefs => "stack contains references",
            MethodInitErrorKind::InaccessibleMember => "inaccessible member",
            MethodInitErrorKind::FieldStaticMismatch => "wrong field staticness",
            MethodInitErrorKind::UnresolvedTokenId => "unresolved token",
            MethodInitErrorKind::NoMatchingOverload => "no matching overload",
            MethodInitErrorKind::InaccessibleType => "inaccessible type",
            MethodInitErrorKind::TypeNotConstructible => "type not constructible",
        }
    }
}

impl fmt::Display for MethodInitErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure-specific payload of a [`MethodInitError`].
#[derive(Debug, Clone, PartialEq)]
pub enum MethodInitDetail {
    None,
    /// Index of the offending instruction in the builder.
    Instruction(usize),
    /// Qualified name of the offending member.
    Member(Arc<str>),
    /// Qualified name of the offending type.
    Type(Arc<str>),
    /// The unresolved or invalid token id.
    Token(u32),
    /// The method group and argument count for which no overload exists.
    NoOverload { group: Arc<str>, arg_count: u32 },
}

/// A method failed to initialize. Terminates initialization; never
/// propagates as a managed error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("method initialization of '{method}' failed: {kind}: {message}")]
pub struct MethodInitError {
    pub kind: MethodInitErrorKind,
    /// Qualified name of the method being initialized.
    pub method: Arc<str>,
    pub message: String,
    pub detail: MethodInitDetail,
}

impl MethodInitError {
    pub fn general(method: Arc<str>, message: impl Into<String>) -> MethodInitError {
        MethodInitError {
            kind: MethodInitErrorKind::General,
            method,
            message: message.into(),
            detail: MethodInitDetail::None,
        }
    }

    pub fn at_instruction(
        kind: MethodInitErrorKind,
        method: Arc<str>,
        index: usize,
        message: impl Into<String>,
    ) -> MethodInitError {
        MethodInitError {
            kind,
            method,
            message: message.into(),
            detail: MethodInitDetail::Instruction(index),
        }
    }

    pub fn for_member(
        kind: MethodInitErrorKind,
        method: Arc<str>,
        member: Arc<str>,
        message: impl Into<String>,
    ) -> MethodInitError {
        MethodInitError {
            kind,
            method,
            message: message.into(),
            detail: MethodInitDetail::Member(member),
        }
    }

    pub fn for_type(
        kind: MethodInitErrorKind,
        method: Arc<str>,
        type_name: Arc<str>,
        message: impl Into<String>,
    ) -> MethodInitError {
        MethodInitError {
            kind,
            method,
            message: message.into(),
            detail: MethodInitDetail::Type(type_name),
        }
    }

    pub fn for_token(
        kind: MethodInitErrorKind,
        method: Arc<str>,
        token: u32,
        message: impl Into<String>,
    ) -> MethodInitError {
        MethodInitError {
            kind,
            method,
            message: message.into(),
            detail: MethodInitDetail::Token(token),
        }
    }

    pub fn no_overload(
        method: Arc<str>,
        group: Arc<str>,
        arg_count: u32,
        message: impl Into<String>,
    ) -> MethodInitError {
        MethodInitError {
            kind: MethodInitErrorKind::NoMatchingOverload,
            method,
            message: message.into(),
            detail: MethodInitDetail::NoOverload { group, arg_count },
        }
    }

    /// The instruction index, when the failure is tied to one.
    pub fn instruction_index(&self) -> Option<usize> {
        match self.detail {
            MethodInitDetail::Instruction(i) => Some(i),
            _ => None,
        }
    }

    /// The token id, when the failure is tied to one.
    pub fn token_id(&self) -> Option<u32> {
        match self.detail {
            MethodInitDetail::Token(t) => Some(t),
            _ => None,
        }
    }
}

/// Catastrophic, non-managed failure conditions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("managed call stack exhausted")]
    StackOverflow,

    #[error("the startup module has no main method")]
    NoMainMethod,

    #[error("the thread was interrupted")]
    ThreadInterrupted,

    #[error("operation attempted on the wrong thread")]
    WrongThread,
}

impl VmError {
    /// The process exit code for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::OutOfMemory => exit_code::OUT_OF_MEMORY,
            VmError::StackOverflow => exit_code::OUT_OF_MEMORY,
            VmError::NoMainMethod => exit_code::METHOD_INIT_FAILED,
            VmError::ThreadInterrupted => exit_code::THREAD_INTERRUPTED,
            VmError::WrongThread => exit_code::WRONG_THREAD,
        }
    }
}
