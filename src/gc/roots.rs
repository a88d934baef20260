//! The root-set walk.
//!
//! The root set is everything that is reachable by definition: local values
//! in every stack frame of a managed thread (arguments, local variables and
//! evaluation-stack slots), the thread's current error and the errors saved
//! while finally clauses run, every module's static reference block, and the
//! strings owned by modules. Interned strings are deliberately not roots;
//! they die like any other value and are then removed from the intern table.

use std::sync::Arc;

use ovum_core::Value;

use crate::runtime::module::StaticRefBlock;
use crate::vm::thread::Thread;
use crate::vm::vm::Vm;

/// Implemented by consumers of the root set (the marker, diagnostics).
pub trait RootSetVisitor {
    /// Visits a non-local root value. Never a reference.
    fn visit_root_value(&mut self, value: &Value);

    /// Visits a local value: an argument, local variable or eval-stack slot.
    /// Local values can be references; implementations must handle them.
    fn visit_root_local_value(&mut self, value: &Value);

    /// Visits a string owned by a module.
    fn visit_root_string(&mut self, value: &Arc<str>);

    /// Called before the values of a static reference block are visited.
    /// Returning false skips the block (and its leave call).
    fn enter_static_ref_block(&mut self, block: &StaticRefBlock) -> bool;

    fn leave_static_ref_block(&mut self, block: &StaticRefBlock);
}

/// Drives a [`RootSetVisitor`] over the root set of one thread plus the
/// process-wide module state.
pub struct RootSetWalker<'vm> {
    vm: &'vm Vm,
}

impl<'vm> RootSetWalker<'vm> {
    pub fn new(vm: &'vm Vm) -> RootSetWalker<'vm> {
        RootSetWalker { vm }
    }

    pub fn walk(&self, thread: &Thread, visitor: &mut impl RootSetVisitor) {
        self.visit_thread(thread, visitor);
        self.visit_modules(visitor);
    }

    fn visit_thread(&self, thread: &Thread, visitor: &mut impl RootSetVisitor) {
        let stack = thread.stack_slots();
        for frame in thread.frames() {
            // Arguments, local variables and the live part of the eval stack
            // are adjacent slot ranges; everything in them is a root.
            let end = frame.eval_base + frame.stack_count as usize;
            for slot in &stack[frame.base..end] {
                visitor.visit_root_local_value(slot);
            }
        }

        visitor.visit_root_value(thread.current_error());
        for saved in thread.error_stack() {
            visitor.visit_root_value(saved);
        }
    }

    fn visit_modules(&self, visitor: &mut impl RootSetVisitor) {
        for module in self.vm.modules() {
            visitor.visit_root_string(&module.name);
            for id in &module.strings {
                visitor.visit_root_string(self.vm.string(*id));
            }
            // File names attached to debug symbols are module-owned strings
            // as well.
            for method_id in &module.methods {
                for overload in &self.vm.method(*method_id).overloads {
                    if let crate::runtime::method::MethodBody::Bytecode(body) = &overload.body {
                        if let Some(debug) = &body.debug_symbols {
                            visitor.visit_root_string(&debug.file);
                        }
                    }
                }
            }

            if visitor.enter_static_ref_block(&module.statics) {
                for cell in &module.statics.values {
                    let value = cell.read();
                    visitor.visit_root_value(&value);
                }
                visitor.leave_static_ref_block(&module.statics);
            }
        }
    }
}
