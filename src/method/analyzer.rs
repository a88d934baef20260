//! The symbolic evaluation stack used by the stack-height analysis.
//!
//! The analyzer walks every control-flow path of a method, carrying a
//! per-slot flag set for the current branch. Slots remember whether they
//! hold the instance argument and whether they hold a reference; the latter
//! is what enforces the core reference rule — references are consumed only
//! by ref-accepting calls or written through, never stored.

use std::collections::VecDeque;

use bitflags::bitflags;

use ovum_core::{RefSignatureBuilder, RefSignaturePool};

use crate::method::instructions::StackChange;

bitflags! {
    /// Flags of one symbolic stack slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlotFlags: u8 {
        const IN_USE = 0x01;
        /// The slot holds the instance argument (`this`).
        const THIS_ARG = 0x02;
        /// The slot holds a reference.
        const IS_REF = 0x04;
    }
}

/// Why a stack change could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// The instruction pops more values than the branch's stack holds.
    Underflow,
    /// A popped slot holds a reference and the instruction does not accept
    /// references.
    RefViolation,
}

#[derive(Debug)]
struct PendingBranch {
    first_instr: usize,
    stack: Vec<SlotFlags>,
}

/// Branch queue plus the current branch's symbolic stack.
#[derive(Debug)]
pub struct StackAnalyzer<'p> {
    ref_signatures: &'p RefSignaturePool,
    current: Vec<SlotFlags>,
    queue: VecDeque<PendingBranch>,
}

impl<'p> StackAnalyzer<'p> {
    pub fn new(ref_signatures: &'p RefSignaturePool) -> StackAnalyzer<'p> {
        StackAnalyzer {
            ref_signatures,
            current: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn ref_signatures(&self) -> &'p RefSignaturePool {
        self.ref_signatures
    }

    pub fn height(&self) -> u32 {
        self.current.len() as u32
    }

    /// Queues a branch whose stack is a copy of the current one, flags and
    /// all. Used for branch targets.
    pub fn enqueue_with_current(&mut self, first_instr: usize) {
        self.queue.push_back(PendingBranch {
            first_instr,
            stack: self.current.clone(),
        });
    }

    /// Queues a branch with a fresh stack of `height` unflagged slots. Used
    /// for the method entry and for catch/finally entries.
    pub fn enqueue_new(&mut self, height: u32, first_instr: usize) {
        self.queue.push_back(PendingBranch {
            first_instr,
            stack: vec![SlotFlags::IN_USE; height as usize],
        });
    }

    /// Moves to the next queued branch; returns the index of its first
    /// instruction.
    pub fn dequeue(&mut self) -> Option<usize> {
        let branch = self.queue.pop_front()?;
        self.current = branch.stack;
        Some(branch.first_instr)
    }

    /// Applies an instruction's stack change. Popped slots are checked for
    /// references unless the instruction accepts them; when `pushes_ref`,
    /// the single pushed slot is flagged as a reference.
    pub fn apply(
        &mut self,
        change: StackChange,
        pushes_ref: bool,
        accepts_refs: bool,
    ) -> Result<(), StackError> {
        let removed = change.removed as usize;
        if removed > self.current.len() {
            return Err(StackError::Underflow);
        }
        let keep = self.current.len() - removed;
        if !accepts_refs
            && self.current[keep..]
                .iter()
                .any(|s| s.contains(SlotFlags::IS_REF))
        {
            return Err(StackError::RefViolation);
        }
        self.current.truncate(keep);
        for i in 0..change.added {
            let mut flags = SlotFlags::IN_USE;
            // Only the topmost pushed slot can be the reference.
            if pushes_ref && i + 1 == change.added {
                flags |= SlotFlags::IS_REF;
            }
            self.current.push(flags);
        }
        Ok(())
    }

    /// Marks the current top of stack as holding the instance argument.
    pub fn mark_top_this(&mut self) {
        if let Some(top) = self.current.last_mut() {
            *top |= SlotFlags::THIS_ARG;
        }
    }

    /// Whether slot `depth` from the top (0 = topmost) holds a reference.
    pub fn is_ref(&self, depth: u32) -> bool {
        let len = self.current.len();
        match len.checked_sub(depth as usize + 1) {
            Some(index) => self.current[index].contains(SlotFlags::IS_REF),
            None => false,
        }
    }

    /// Whether slot `depth` from the top holds the instance argument.
    pub fn is_this(&self, depth: u32) -> bool {
        let len = self.current.len();
        match len.checked_sub(depth as usize + 1) {
            Some(index) => self.current[index].contains(SlotFlags::THIS_ARG),
            None => false,
        }
    }

    /// Whether any of the `count` topmost slots holds a reference.
    pub fn has_refs(&self, count: u32) -> bool {
        (0..count).any(|d| self.is_ref(d))
    }

    /// Derives the reference signature of the `count` topmost slots: bit 0
    /// corresponds to the deepest of them (the instance or invoked value),
    /// the last bit to the topmost. Returns the interned token, or 0 for a
    /// trivial signature.
    pub fn ref_signature(&self, count: u32) -> u32 {
        let mut builder = RefSignatureBuilder::new(count);
        for bit in 0..count {
            if self.is_ref(count - bit - 1) {
                builder.set_param(bit, true);
            }
        }
        builder.commit(self.ref_signatures)
    }

    /// Derives a signature for a call that skips bit 0 (static calls and
    /// constructors): bit `i + 1` reflects argument `i` of `count` stack
    /// arguments.
    pub fn ref_signature_skipping_instance(&self, count: u32) -> u32 {
        let mut builder = RefSignatureBuilder::new(count + 1);
        for i in 0..count {
            if self.is_ref(count - i - 1) {
                builder.set_param(i + 1, true);
            }
        }
        builder.commit(self.ref_signatures)
    }
}
