//! Stack frames.
//!
//! A thread's call stack is one contiguous slot array. Each frame covers a
//! range of it: the arguments come first (they are the caller's topmost
//! eval-stack slots — frames overlap), then the local variables, then the
//! frame's own evaluation stack. Frames never move, which is what makes
//! local references sound.

use std::sync::Arc;

use crate::bytecode::internal::LocalOffset;
use crate::runtime::method::MethodOverload;

/// One call frame.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Current evaluation-stack height.
    pub stack_count: u32,
    /// Number of arguments passed, including the instance. Required by the
    /// `ldargc` instruction.
    pub argc: u32,
    /// Absolute slot index of the first argument.
    pub base: usize,
    /// Absolute slot index of the first local variable.
    pub locals_base: usize,
    /// Absolute slot index of the bottom of the evaluation stack.
    pub eval_base: usize,
    /// The caller's instruction offset, restored on return and used by the
    /// stack-trace formatter.
    pub prev_ip: u32,
    /// The invoked overload. The first frame on a thread has none; it only
    /// carries the arguments for the startup method.
    pub method: Option<Arc<MethodOverload>>,
}

impl StackFrame {
    /// The first frame on a thread: no method, no locals, just an eval area
    /// starting at slot 0.
    pub fn first() -> StackFrame {
        StackFrame {
            stack_count: 0,
            argc: 0,
            base: 0,
            locals_base: 0,
            eval_base: 0,
            prev_ip: 0,
            method: None,
        }
    }

    /// Resolves a [`LocalOffset`] to an absolute slot index.
    pub fn slot(&self, offset: LocalOffset) -> usize {
        (self.locals_base as i64 + offset.0 as i64) as usize
    }

    /// Absolute slot index of eval-stack entry `depth` from the top
    /// (0 = topmost).
    pub fn top_slot(&self, depth: u32) -> usize {
        debug_assert!(depth < self.stack_count);
        self.eval_base + (self.stack_count - depth - 1) as usize
    }

    /// Absolute slot index one past the current eval-stack top.
    pub fn next_slot(&self) -> usize {
        self.eval_base + self.stack_count as usize
    }
}
