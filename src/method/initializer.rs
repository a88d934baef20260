//! Method initialization: parse, analyze, fold, emit.
//!
//! Drives the full rewrite of one overload. The stack-height analysis and
//! the peephole folding happen in the same walk: as each instruction's entry
//! height becomes known, its input and output operands are assigned their
//! stack-slot addresses, and the three local rewrites are applied greedily —
//! folding a producer's output into a following store-local, folding a plain
//! load-local into a consumer that can read from a non-stack location, and
//! fusing a comparison with the conditional branch that consumes it. All
//! three are guarded by the incoming-branches flag so that no rewrite
//! crosses a join point.

use std::sync::Arc;

use ovum_core::{MethodInitError, MethodInitErrorKind, TypeId};

use crate::bytecode::internal::{InternalOp, LocalOffset};
use crate::method::analyzer::{StackAnalyzer, StackError};
use crate::method::buffer::MethodBuffer;
use crate::method::builder::MethodBuilder;
use crate::method::instructions::{Instruction, InstrKind, StackChange};
use crate::method::parser::MethodParser;
use crate::runtime::method::{
    DebugSymbols, InitializedBody, MethodOverload, TryBlock, TryHandler,
};
use crate::vm::thread::{Abort, Thread};
use crate::vm::vm::Vm;

pub struct MethodInitializer<'a> {
    vm: &'a Vm,
}

impl<'a> MethodInitializer<'a> {
    pub fn new(vm: &'a Vm) -> MethodInitializer<'a> {
        MethodInitializer { vm }
    }

    /// Initializes the overload if it is not already initialized, then runs
    /// the static constructors of every type the method touches. Safe
    /// against concurrent callers: the body install is a discard-duplicate
    /// publish.
    pub fn initialize(
        &self,
        overload: &Arc<MethodOverload>,
        thread: &mut Thread,
    ) -> Result<(), Abort> {
        if overload.is_initialized() {
            return Ok(());
        }
        let name = self.vm.qualified_method_name(overload.group);
        tracing::debug!(method = %name, "initializing method");

        let (body, types) = self.build(overload).map_err(Abort::MethodInit)?;
        tracing::debug!(
            method = %name,
            bytes = body.code.len(),
            "method initialized"
        );
        overload.install(body);

        thread.call_static_constructors(&types)
    }

    /// Runs the pipeline and produces the initialized body plus the list of
    /// types whose static constructors must run before the method executes.
    /// Never mutates the overload; pure apart from ref-signature interning.
    pub fn build(
        &self,
        overload: &MethodOverload,
    ) -> Result<(InitializedBody, Vec<TypeId>), MethodInitError> {
        let mut builder = MethodBuilder::new();
        let parsed = MethodParser::parse_into(self.vm, overload, &mut builder)?;
        let mut try_blocks = parsed.try_blocks;
        let mut debug_symbols = parsed.debug_symbols;

        let mut stack = StackAnalyzer::new(self.vm.ref_signatures());
        self.calculate_stack_heights(overload, &mut builder, &mut stack, &try_blocks)?;

        builder.perform_removals(&mut try_blocks, debug_symbols.as_mut());

        let code = Self::write_body(&builder);
        Self::finalize_try_block_offsets(&builder, &mut try_blocks);
        if let Some(debug) = debug_symbols.as_mut() {
            Self::finalize_debug_symbol_offsets(&builder, debug);
        }

        Ok((
            InitializedBody {
                code,
                try_blocks,
                debug_symbols,
                locals: overload.locals(),
                max_stack: overload.max_stack(),
            },
            builder.types_to_initialize().to_vec(),
        ))
    }

    // ------------------------------------------------------------------
    // Analysis walk
    // ------------------------------------------------------------------

    fn calculate_stack_heights(
        &self,
        method: &MethodOverload,
        builder: &mut MethodBuilder,
        stack: &mut StackAnalyzer<'_>,
        try_blocks: &[TryBlock],
    ) -> Result<(), MethodInitError> {
        let name = self.vm.qualified_method_name(method.group);
        let locals = method.locals();
        let max_stack = method.max_stack();

        // One branch per entry point: the method start with an empty stack,
        // each catch clause with the caught error, each finally clause with
        // nothing.
        stack.enqueue_new(0, 0);
        for block in try_blocks {
            match &block.handler {
                TryHandler::Catch(catches) => {
                    for c in catches {
                        if (c.start as usize) < builder.len() {
                            stack.enqueue_new(1, c.start as usize);
                        }
                    }
                }
                TryHandler::Finally { start, .. } => {
                    if (*start as usize) < builder.len() {
                        stack.enqueue_new(0, *start as usize);
                    }
                }
            }
        }

        'branches: while let Some(first) = stack.dequeue() {
            let mut index = first;
            let mut prev: Option<usize> = None;

            loop {
                if index >= builder.len() {
                    if stack.height() != 0 {
                        return Err(MethodInitError::at_instruction(
                            MethodInitErrorKind::InsufficientStackHeight,
                            Arc::clone(&name),
                            index,
                            "control reaches the end of the method with values on the stack",
                        ));
                    }
                    continue 'branches;
                }

                // Merge rule: a previously visited instruction must be
                // reached with the same height on every path.
                if let Some(recorded) = builder.stack_height(index) {
                    if recorded != stack.height() {
                        return Err(MethodInitError::at_instruction(
                            MethodInitErrorKind::InconsistentStack,
                            Arc::clone(&name),
                            index,
                            format!(
                                "stack height {} does not match {} from an earlier path",
                                stack.height(),
                                recorded
                            ),
                        ));
                    }
                    continue 'branches;
                }
                let height = stack.height();
                builder.set_stack_height(index, height);

                // Fold a producer's output into a following store-local.
                if let Some(target) = builder.instr(index).store_target() {
                    if let Some(p) = prev {
                        if builder.instr(p).has_output()
                            && !builder.is_marked_for_removal(p)
                            && !builder.instr(index).has_incoming_branches()
                        {
                            builder.instr_mut(p).update_output(target, false);
                            builder.mark_for_removal(index);
                        }
                    }
                }

                if builder.instr(index).opcode == InternalOp::Rethrow
                    && !Self::inside_catch_clause(try_blocks, index)
                {
                    return Err(MethodInitError::at_instruction(
                        MethodInitErrorKind::General,
                        Arc::clone(&name),
                        index,
                        "rethrow is only valid inside a catch clause",
                    ));
                }

                // Fuse a comparison with the conditional branch consuming it.
                let mut fused = false;
                if let Some(p) = prev {
                    fused = self.try_fuse_comparison(builder, p, index);
                }

                if builder.instr(index).accepts_refs() {
                    self.resolve_ref_signature(&name, builder, stack, index)?;
                }

                self.try_use_fast_field_access(method, builder, stack, index);

                let removed = builder.is_marked_for_removal(index);
                // The declared change, captured before operand folding can
                // flip the opcode's stack bits. For a fused branch the
                // original branch's single pop keeps the books straight; the
                // comparison's pops were accounted when it was visited.
                let change = if fused {
                    StackChange::new(1, 0)
                } else {
                    builder.instr(index).stack_change()
                };
                if change.removed as u32 > height {
                    return Err(MethodInitError::at_instruction(
                        MethodInitErrorKind::InsufficientStackHeight,
                        Arc::clone(&name),
                        index,
                        "the instruction pops more values than the stack holds",
                    ));
                }

                if builder.instr(index).has_input() && !removed && !fused {
                    let mut folded = false;
                    if !builder.instr(index).requires_stack_input() {
                        if let Some(p) = prev {
                            if !builder.is_marked_for_removal(p)
                                && !builder.instr(index).has_incoming_branches()
                            {
                                if let Some(source) = builder.instr(p).load_source() {
                                    builder.instr_mut(index).update_input(source, false);
                                    builder.mark_for_removal(p);
                                    folded = true;
                                }
                            }
                        }
                    }
                    if !folded {
                        let offset =
                            LocalOffset::stack_slot(locals, height - change.removed as u32);
                        builder.instr_mut(index).update_input(offset, true);
                    }
                }

                {
                    let instr = builder.instr(index);
                    let pushes_ref = instr.pushes_ref();
                    let accepts_refs = instr.accepts_refs();
                    stack
                        .apply(change, pushes_ref, accepts_refs)
                        .map_err(|e| match e {
                            StackError::Underflow => MethodInitError::at_instruction(
                                MethodInitErrorKind::InsufficientStackHeight,
                                Arc::clone(&name),
                                index,
                                "the instruction pops more values than the stack holds",
                            ),
                            StackError::RefViolation => MethodInitError::at_instruction(
                                MethodInitErrorKind::StackHasRefs,
                                Arc::clone(&name),
                                index,
                                "a reference may not be stored; it can only be passed \
                                 to a ref-accepting call or written through",
                            ),
                        })?;
                }
                if stack.height() > max_stack {
                    return Err(MethodInitError::at_instruction(
                        MethodInitErrorKind::General,
                        Arc::clone(&name),
                        index,
                        format!("declared max stack height {max_stack} exceeded"),
                    ));
                }

                // Values loaded from the instance argument are remembered so
                // member-access checks can recognize `this` on the stack.
                if method.is_instance()
                    && builder.instr(index).load_source()
                        == Some(LocalOffset::argument(0, method.effective_param_count()))
                {
                    stack.mark_top_this();
                }

                if builder.instr(index).has_output() && !removed && !fused {
                    let offset = LocalOffset::stack_slot(locals, height - change.removed as u32);
                    builder.instr_mut(index).update_output(offset, true);
                }

                // Successors.
                let instr = builder.instr(index);
                if instr.is_branch() {
                    let target = instr.branch_target().unwrap();
                    stack.enqueue_with_current(target);
                    if instr.is_conditional() {
                        prev = Some(index);
                        index += 1;
                        continue;
                    }
                    // br, leave: the fall-through is not enqueued.
                    continue 'branches;
                }
                if instr.is_switch() {
                    for &target in instr.switch_targets().unwrap() {
                        stack.enqueue_with_current(target);
                    }
                    prev = Some(index);
                    index += 1;
                    continue;
                }
                match instr.opcode {
                    InternalOp::Ret | InternalOp::RetNull | InternalOp::EndFinally => {
                        if stack.height() != 0 {
                            return Err(MethodInitError::at_instruction(
                                MethodInitErrorKind::InsufficientStackHeight,
                                Arc::clone(&name),
                                index,
                                "values remain on the stack at a return",
                            ));
                        }
                        continue 'branches;
                    }
                    InternalOp::Throw | InternalOp::Rethrow => {
                        continue 'branches;
                    }
                    _ => {
                        prev = Some(index);
                        index += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn inside_catch_clause(try_blocks: &[TryBlock], index: usize) -> bool {
        try_blocks.iter().any(|block| match &block.handler {
            TryHandler::Catch(catches) => catches
                .iter()
                .any(|c| index >= c.start as usize && index < c.end as usize),
            TryHandler::Finally { .. } => false,
        })
    }

    /// Attempts to replace the conditional branch at `index` with a fused
    /// compare-and-branch, removing the comparison at `p`.
    fn try_fuse_comparison(
        &self,
        builder: &mut MethodBuilder,
        p: usize,
        index: usize,
    ) -> bool {
        let branch_if_true = match builder.instr(index).opcode {
            InternalOp::BrTrueS => true,
            InternalOp::BrFalseS => false,
            _ => return false,
        };
        if builder.instr(index).has_incoming_branches()
            || builder.is_marked_for_removal(index)
            || builder.is_marked_for_removal(p)
        {
            return false;
        }
        let Some(fused) = Self::fused_opcode(builder.instr(p).opcode, branch_if_true) else {
            return false;
        };
        let args = match &builder.instr(p).kind {
            InstrKind::CompareOp { args, .. } => *args,
            _ => return false,
        };
        let target = builder.instr(index).branch_target().unwrap();
        builder.replace_instr(index, Instruction::branch_comparison(args, target, fused));
        builder.mark_for_removal(p);
        true
    }

    /// Switches a field access whose instance is the `this` argument to the
    /// unchecked fast form: the instance's type is the method's declaring
    /// type, so the runtime type check is already proven.
    fn try_use_fast_field_access(
        &self,
        method: &MethodOverload,
        builder: &mut MethodBuilder,
        stack: &StackAnalyzer<'_>,
        index: usize,
    ) {
        let (field, instance_depth) = match &builder.instr(index).kind {
            InstrKind::LoadField { field, .. }
                if matches!(
                    builder.instr(index).opcode,
                    InternalOp::LdFldL | InternalOp::LdFldS
                ) =>
            {
                (*field, 0)
            }
            InstrKind::StoreField { field, .. }
                if builder.instr(index).opcode == InternalOp::StFld =>
            {
                (*field, 1)
            }
            _ => return,
        };
        if !stack.is_this(instance_depth) {
            return;
        }
        let Some(method_type) = self.vm.method(method.group).decl_type else {
            return;
        };
        let Some(field_type) = self.vm.field(field).decl_type else {
            return;
        };
        if !self.vm.is_same_or_derived(method_type, field_type) {
            return;
        }
        let instr = builder.instr_mut(index);
        instr.opcode = match instr.opcode {
            InternalOp::LdFldL => InternalOp::LdFldFastL,
            InternalOp::LdFldS => InternalOp::LdFldFastS,
            _ => InternalOp::StFldFast,
        };
    }

    /// The fused opcode for a comparison followed by `brtrue`/`brfalse`.
    /// `cmp` and `concat` produce non-Boolean values and never fuse.
    fn fused_opcode(comparison: InternalOp, branch_if_true: bool) -> Option<InternalOp> {
        Some(match (comparison, branch_if_true) {
            (InternalOp::EqS, true) => InternalOp::BrEq,
            (InternalOp::EqS, false) => InternalOp::BrNeq,
            (InternalOp::LtS, true) => InternalOp::BrLt,
            (InternalOp::LtS, false) => InternalOp::BrGte,
            (InternalOp::GtS, true) => InternalOp::BrGt,
            (InternalOp::GtS, false) => InternalOp::BrLte,
            (InternalOp::LteS, true) => InternalOp::BrLte,
            (InternalOp::LteS, false) => InternalOp::BrGt,
            (InternalOp::GteS, true) => InternalOp::BrGte,
            (InternalOp::GteS, false) => InternalOp::BrLt,
            _ => return None,
        })
    }

    /// Derives and embeds the reference signature of a call-like
    /// instruction, and validates it against statically resolved callees.
    fn resolve_ref_signature(
        &self,
        name: &Arc<str>,
        builder: &mut MethodBuilder,
        stack: &StackAnalyzer<'_>,
        index: usize,
    ) -> Result<(), MethodInitError> {
        enum Callee {
            Dynamic,
            Static { method: ovum_core::MethodId, overload: u32, argc: u32 },
            Ctor { type_id: TypeId, argc: u32 },
        }

        let (signature, callee) = match &builder.instr(index).kind {
            InstrKind::Call { arg_count, .. } | InstrKind::CallMember { arg_count, .. } => {
                (stack.ref_signature(arg_count + 1), Callee::Dynamic)
            }
            InstrKind::StaticCall {
                arg_count,
                method,
                overload,
                pops_instance,
                ..
            } => {
                let signature = if *pops_instance {
                    stack.ref_signature(arg_count + 1)
                } else {
                    stack.ref_signature_skipping_instance(*arg_count)
                };
                (
                    signature,
                    Callee::Static {
                        method: *method,
                        overload: *overload,
                        argc: *arg_count,
                    },
                )
            }
            InstrKind::NewObject {
                type_id, arg_count, ..
            } => (
                stack.ref_signature_skipping_instance(*arg_count),
                Callee::Ctor {
                    type_id: *type_id,
                    argc: *arg_count,
                },
            ),
            _ => return Ok(()),
        };

        builder.instr_mut(index).apply_ref_signature(signature);
        builder.set_ref_signature(index, signature);

        // Statically resolved callees are validated now; dynamic calls carry
        // the signature through to the invocation routine.
        let (target, argc) = match callee {
            Callee::Dynamic => return Ok(()),
            Callee::Static {
                method,
                overload,
                argc,
            } => (
                Arc::clone(&self.vm.method(method).overloads[overload as usize]),
                argc,
            ),
            Callee::Ctor { type_id, argc } => {
                let ctor = self
                    .vm
                    .type_info(type_id)
                    .instance_ctor
                    .expect("constructible type lost its constructor");
                let (_, overload) = self
                    .vm
                    .method(ctor)
                    .resolve_overload(argc)
                    .expect("constructor overload vanished after parsing");
                (Arc::clone(overload), argc)
            }
        };

        if signature != target.ref_signature {
            if let Some(arg) =
                target.verify_ref_signature(signature, argc, self.vm.ref_signatures())
            {
                let callee_name = self.vm.qualified_method_name(target.group);
                let declared = self
                    .vm
                    .ref_signatures()
                    .is_param_ref(target.ref_signature, arg + 1);
                return Err(MethodInitError::at_instruction(
                    MethodInitErrorKind::General,
                    Arc::clone(name),
                    index,
                    format!(
                        "argument {arg} of '{callee_name}' must be passed {}",
                        if declared { "by reference" } else { "by value" }
                    ),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn write_body(builder: &MethodBuilder) -> Box<[u8]> {
        let mut buf = MethodBuffer::new(builder.byte_size());
        for i in 0..builder.len() {
            debug_assert_eq!(buf.offset(), builder.new_offset(i));
            let mut resolve = |target: usize| builder.jump_offset(target, i);
            builder.instr(i).write(&mut buf, &mut resolve);
        }
        buf.release()
    }

    fn finalize_try_block_offsets(builder: &MethodBuilder, try_blocks: &mut [TryBlock]) {
        for block in try_blocks {
            block.try_start = builder.new_offset(block.try_start as usize) as u32;
            block.try_end = builder.new_offset(block.try_end as usize) as u32;
            match &mut block.handler {
                TryHandler::Catch(catches) => {
                    for c in catches {
                        c.start = builder.new_offset(c.start as usize) as u32;
                        c.end = builder.new_offset(c.end as usize) as u32;
                    }
                }
                TryHandler::Finally { start, end } => {
                    *start = builder.new_offset(*start as usize) as u32;
                    *end = builder.new_offset(*end as usize) as u32;
                }
            }
        }
    }

    fn finalize_debug_symbol_offsets(builder: &MethodBuilder, debug: &mut DebugSymbols) {
        for sym in &mut debug.symbols {
            sym.start = builder.new_offset(sym.start as usize) as u32;
            sym.end = builder.new_offset(sym.end as usize) as u32;
        }
    }
}
