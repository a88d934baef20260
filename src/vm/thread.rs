//! Managed threads and the interpreter loop.
//!
//! One [`Thread`] per OS thread. The thread owns the contiguous call stack,
//! executes the emitted instruction stream one straight-line dispatch loop
//! per frame, implements throw/rethrow, leave and try/catch/finally, and
//! checks for GC suspension requests at every safepoint: on entry to
//! [`Thread::evaluate`] and before each instruction dispatch.

use std::sync::Arc;

use ovum_core::{MethodId, MethodInitError, StrId, TypeId, Value, VmError};

use crate::bytecode::internal::{
    self as oa, InternalOp, LocalOffset, OPCODE_SIZE, read_f64, read_i32, read_i64, read_local,
    read_u32, read_u64, read_u8,
};
use crate::gc::gc::{ThreadRequest, ThreadShared};
use crate::gc::heap::ObjectBody;
use crate::method::initializer::MethodInitializer;
use crate::runtime::member::{FieldStorage, MemberKind};
use crate::runtime::method::{CaughtType, InitializedBody, MethodBody, MethodOverload, TryHandler};
use crate::runtime::standard::{INDEXER_MEMBER, ITERATOR_MEMBER, TO_STRING_MEMBER, error_fields};
use crate::runtime::type_info::Operator;
use crate::vm::frame::StackFrame;
use crate::vm::stack_trace::StackTraceFormatter;
use crate::vm::vm::Vm;

/// The managed call stack budget: 4 MB of value slots, contiguous.
const CALL_STACK_BYTES: usize = 4 << 20;
const CALL_STACK_SLOTS: usize = CALL_STACK_BYTES / std::mem::size_of::<Value>();

/// Execution state of a managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Created but not started.
    Created = 0,
    Running = 1,
    /// Parked at a safepoint while a GC cycle runs.
    SuspendedByGc = 2,
    /// The startup method returned, or the thread died.
    Stopped = 3,
}

impl ThreadState {
    pub fn from_raw(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Created,
            1 => ThreadState::Running,
            2 => ThreadState::SuspendedByGc,
            _ => ThreadState::Stopped,
        }
    }
}

/// Why execution is unwinding out of the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum Abort {
    /// A managed error was thrown; it is in the thread's current-error slot.
    Thrown,
    /// A method failed verification. Never convertible into a managed error.
    MethodInit(MethodInitError),
    /// A catastrophic condition.
    Fatal(VmError),
}

pub struct Thread {
    vm: Arc<Vm>,
    shared: Arc<ThreadShared>,
    /// The contiguous call stack. Frames overlap: a callee's arguments are
    /// the caller's topmost eval slots.
    stack: Vec<Value>,
    frames: Vec<StackFrame>,
    /// Byte offset into the current method's emitted body.
    ip: u32,
    /// The error being handled. Examined by the GC during a cycle.
    current_error: Value,
    /// Errors saved while finally clauses run. Owned by the thread rather
    /// than the native call stack so the root-set walker can reach them.
    error_stack: Vec<Value>,
}

impl Thread {
    pub fn new(vm: Arc<Vm>) -> Thread {
        let shared = Arc::new(ThreadShared::new());
        vm.gc().register_thread(Arc::clone(&shared));
        Thread {
            vm,
            shared,
            stack: Vec::new(),
            frames: vec![StackFrame::first()],
            ip: 0,
            current_error: Value::Null,
            error_stack: Vec::new(),
        }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn shared(&self) -> &Arc<ThreadShared> {
        &self.shared
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn current_error(&self) -> &Value {
        &self.current_error
    }

    pub(crate) fn error_stack(&self) -> &[Value] {
        &self.error_stack
    }

    pub(crate) fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub(crate) fn stack_slots(&self) -> &[Value] {
        &self.stack
    }

    /// Reads an absolute stack slot. Used by native methods to reach their
    /// arguments.
    pub fn stack_value(&self, slot: usize) -> &Value {
        &self.stack[slot]
    }

    // ------------------------------------------------------------------
    // Safepoints and unmanaged regions
    // ------------------------------------------------------------------

    #[inline]
    fn safepoint(&mut self) {
        if self.shared.pending_request() != ThreadRequest::None {
            self.handle_request();
        }
    }

    fn handle_request(&mut self) {
        match self.shared.pending_request() {
            ThreadRequest::None => {}
            ThreadRequest::SuspendForGc => self.suspend_for_gc(),
        }
    }

    /// Parks the thread until the GC releases its cycle lock.
    fn suspend_for_gc(&mut self) {
        tracing::trace!("suspending for gc");
        self.shared.set_state(ThreadState::SuspendedByGc);
        self.shared.wait_for_cycle();
        self.shared.set_state(ThreadState::Running);
    }

    /// Marks the thread as not touching managed memory. Unmanaged regions
    /// are flat: a nested entry collapses and returns false.
    pub fn enter_unmanaged_region(&mut self) -> bool {
        self.shared.enter_unmanaged()
    }

    /// Leaves the unmanaged region. If a GC cycle is in progress the thread
    /// blocks on the cycle lock before resuming. Returns false when the
    /// thread was not in an unmanaged region.
    pub fn leave_unmanaged_region(&mut self) -> bool {
        let left = self.shared.leave_unmanaged();
        if left && self.shared.pending_request() == ThreadRequest::SuspendForGc {
            self.suspend_for_gc();
        }
        left
    }

    // ------------------------------------------------------------------
    // Stack plumbing
    // ------------------------------------------------------------------

    fn cur(&self) -> &StackFrame {
        self.frames.last().unwrap()
    }

    fn cur_mut(&mut self) -> &mut StackFrame {
        self.frames.last_mut().unwrap()
    }

    fn ensure_capacity(&mut self, top: usize) -> Result<(), Abort> {
        if top > CALL_STACK_SLOTS {
            return Err(Abort::Fatal(VmError::StackOverflow));
        }
        if self.stack.len() < top {
            self.stack.resize(top, Value::Null);
        }
        Ok(())
    }

    /// Pushes a value onto the current frame's evaluation stack.
    pub fn push(&mut self, value: Value) -> Result<(), Abort> {
        let slot = self.cur().next_slot();
        self.ensure_capacity(slot + 1)?;
        self.stack[slot] = value;
        self.cur_mut().stack_count += 1;
        Ok(())
    }

    /// Pops the top value off the current evaluation stack.
    pub fn pop(&mut self) -> Value {
        let slot = self.cur().top_slot(0);
        self.cur_mut().stack_count -= 1;
        self.stack[slot].clone()
    }

    fn slot_of(&self, offset: LocalOffset) -> usize {
        self.cur().slot(offset)
    }

    fn read_slot(&self, offset: LocalOffset) -> Value {
        self.stack[self.slot_of(offset)].clone()
    }

    fn write_slot(&mut self, offset: LocalOffset, value: Value) {
        let slot = self.slot_of(offset);
        self.stack[slot] = value;
    }

    // ------------------------------------------------------------------
    // Entry point and invocation
    // ------------------------------------------------------------------

    /// Starts the thread: runs `overload` with `args` and returns its
    /// result. The overload must not be an instance method and must not
    /// have ref parameters; the caller is responsible for overload
    /// resolution.
    pub fn start(
        &mut self,
        overload: &Arc<MethodOverload>,
        args: Vec<Value>,
    ) -> Result<Value, Abort> {
        if self.shared.state() != ThreadState::Created {
            return Err(Abort::Fatal(VmError::WrongThread));
        }
        self.shared.set_state(ThreadState::Running);

        let argc = args.len() as u32;
        for arg in args {
            self.push(arg)?;
        }
        let args_base = self.cur().eval_base + (self.cur().stack_count - argc) as usize;
        let result = self.invoke_method_overload(overload, argc, args_base);
        self.cur_mut().stack_count -= argc;

        self.shared.set_state(ThreadState::Stopped);
        result
    }

    /// Invokes one overload with `argc` arguments (excluding the instance)
    /// sitting at `args_base` (including the instance). The caller's stack
    /// count is left untouched; call sites pop the consumed slots.
    fn invoke_method_overload(
        &mut self,
        overload: &Arc<MethodOverload>,
        argc: u32,
        args_base: usize,
    ) -> Result<Value, Abort> {
        let mut argc = argc;
        if overload.is_variadic() {
            argc = self.prepare_variadic_args(overload, argc, args_base)?;
        }
        let total = argc + overload.instance_offset();

        match &overload.body {
            MethodBody::Native(native) => {
                self.safepoint();
                native(self, total, args_base)
            }
            MethodBody::Bytecode(_) => {
                if !overload.is_initialized() {
                    let vm = Arc::clone(&self.vm);
                    MethodInitializer::new(&vm).initialize(overload, self)?;
                }
                let body = Arc::clone(overload.initialized().unwrap());

                let locals_base = args_base + total as usize;
                let eval_base = locals_base + body.locals as usize;
                // One slot of slack: newobj briefly holds the new instance
                // alongside a full argument list.
                self.ensure_capacity(eval_base + body.max_stack as usize + 1)?;
                for slot in locals_base..eval_base {
                    self.stack[slot] = Value::Null;
                }

                self.frames.push(StackFrame {
                    stack_count: 0,
                    argc: total,
                    base: args_base,
                    locals_base,
                    eval_base,
                    prev_ip: self.ip,
                    method: Some(Arc::clone(overload)),
                });
                self.ip = 0;

                let outcome = loop {
                    match self.evaluate() {
                        Ok(()) => break Ok(()),
                        Err(Abort::Thrown) => match self.find_error_handler(None) {
                            Ok(()) => continue,
                            Err(err) => break Err(err),
                        },
                        Err(err) => break Err(err),
                    }
                };

                let result = match outcome {
                    Ok(()) => {
                        debug_assert_eq!(self.cur().stack_count, 1);
                        Ok(self.stack[eval_base].clone())
                    }
                    Err(err) => Err(err),
                };

                let frame = self.frames.pop().unwrap();
                self.ip = frame.prev_ip;
                result
            }
        }
    }

    /// Packs surplus arguments into a fresh List for a variadic overload.
    /// Slots are rewritten in place; the caller's stack count is untouched
    /// and the dead surplus slots fall off when the call site pops. Returns
    /// the normalized argument count (excluding the instance).
    fn prepare_variadic_args(
        &mut self,
        overload: &Arc<MethodOverload>,
        argc: u32,
        args_base: usize,
    ) -> Result<u32, Abort> {
        let params = overload.param_count();
        let fixed = params - 1;
        let list_slot = args_base + overload.instance_offset() as usize + fixed as usize;
        let surplus = argc - fixed;

        self.ensure_capacity(list_slot + 1)?;
        let elements: Vec<Value> = self.stack[list_slot..list_slot + surplus as usize].to_vec();
        let vm = Arc::clone(&self.vm);
        let handle = match vm.gc().alloc_body(vm.standard.list, ObjectBody::List(elements)) {
            Ok(handle) => handle,
            Err(_) => return self.throw_memory_error(),
        };
        self.stack[list_slot] = Value::Object {
            type_id: vm.standard.list,
            handle,
        };
        Ok(params)
    }

    /// Runs the static constructors recorded during a method's
    /// initialization. Constructors that already ran, or are running further
    /// up this call chain, are skipped.
    pub(crate) fn call_static_constructors(&mut self, types: &[TypeId]) -> Result<(), Abort> {
        let vm = Arc::clone(&self.vm);
        for &type_id in types {
            let info = vm.type_info(type_id);
            let Some(ctor) = info.static_ctor else {
                continue;
            };
            if !info.begin_static_ctor() {
                continue;
            }
            let Some((_, overload)) = vm.method(ctor).resolve_overload(0) else {
                return Err(Abort::MethodInit(MethodInitError::general(
                    vm.qualified_method_name(ctor),
                    "a static constructor must accept zero arguments",
                )));
            };
            let overload = Arc::clone(overload);
            let base = self.cur().next_slot();
            self.invoke_method_overload(&overload, 0, base)?;
            info.finish_static_ctor();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // The dispatch loop
    // ------------------------------------------------------------------

    /// Evaluates emitted bytecode at the current instruction pointer in the
    /// current frame. Returns on `ret`/`retnull` (one result value on the
    /// eval stack, or none for a finally clause's `endfinally`).
    fn evaluate(&mut self) -> Result<(), Abort> {
        self.safepoint();

        let body: Arc<InitializedBody> = {
            let method = self.cur().method.as_ref().expect("evaluate without a method");
            Arc::clone(method.initialized().expect("evaluate on uninitialized method"))
        };
        let code: &[u8] = &body.code;
        let mut cursor = self.ip as usize;

        loop {
            self.safepoint();
            self.ip = cursor as u32;

            let opcode = match InternalOp::try_from(read_u8(code, cursor)) {
                Ok(op) => op,
                Err(_) => panic!("corrupt instruction stream at offset {cursor}"),
            };
            let args = cursor + OPCODE_SIZE;

            match opcode {
                InternalOp::Nop => {
                    cursor = args;
                }
                InternalOp::Pop => {
                    self.cur_mut().stack_count -= 1;
                    cursor = args;
                }
                InternalOp::Ret => {
                    debug_assert_eq!(self.cur().stack_count, 1);
                    return Ok(());
                }
                InternalOp::RetNull => {
                    debug_assert_eq!(self.cur().stack_count, 0);
                    let slot = self.cur().next_slot();
                    self.stack[slot] = Value::Null;
                    self.cur_mut().stack_count += 1;
                    return Ok(());
                }

                // mvloc: bit 0 pops the source, bit 1 pushes the target.
                InternalOp::MvlocLL
                | InternalOp::MvlocSL
                | InternalOp::MvlocLS
                | InternalOp::MvlocSS => {
                    let source = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let value = self.read_slot(source);
                    self.write_slot(target, value);
                    let raw = u8::from(opcode);
                    let frame = self.cur_mut();
                    frame.stack_count -= (raw & 1) as u32;
                    frame.stack_count += ((raw >> 1) & 1) as u32;
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }

                // Reference-cell moves.
                InternalOp::MvlocRL | InternalOp::MvlocRS => {
                    let source = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let cell = self.read_slot(source);
                    let value = self.read_through_ref(&cell);
                    self.write_slot(target, value);
                    if opcode == InternalOp::MvlocRS {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }
                InternalOp::MvlocLR | InternalOp::MvlocSR => {
                    let source = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let cell = self.read_slot(target);
                    let value = self.read_slot(source);
                    self.write_through_ref(&cell, value);
                    if opcode == InternalOp::MvlocSR {
                        self.cur_mut().stack_count -= 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }

                InternalOp::LdNullL | InternalOp::LdNullS => {
                    let target = read_local(code, args);
                    self.write_slot(target, Value::Null);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::ONE_LOCAL_SIZE;
                }
                InternalOp::LdFalseL | InternalOp::LdFalseS => {
                    let target = read_local(code, args);
                    self.write_slot(target, Value::Bool(false));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::ONE_LOCAL_SIZE;
                }
                InternalOp::LdTrueL | InternalOp::LdTrueS => {
                    let target = read_local(code, args);
                    self.write_slot(target, Value::Bool(true));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::ONE_LOCAL_SIZE;
                }
                InternalOp::LdcIL | InternalOp::LdcIS => {
                    let target = read_local(code, args);
                    let value = read_i64(code, args + 4);
                    self.write_slot(target, Value::Int(value));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_VALUE64_SIZE;
                }
                InternalOp::LdcUL | InternalOp::LdcUS => {
                    let target = read_local(code, args);
                    let value = read_u64(code, args + 4);
                    self.write_slot(target, Value::UInt(value));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_VALUE64_SIZE;
                }
                InternalOp::LdcRL | InternalOp::LdcRS => {
                    let target = read_local(code, args);
                    let value = read_f64(code, args + 4);
                    self.write_slot(target, Value::Real(value));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_VALUE64_SIZE;
                }
                InternalOp::LdStrL | InternalOp::LdStrS => {
                    let target = read_local(code, args);
                    let id = StrId(read_u32(code, args + 4));
                    let value = Value::Str(Arc::clone(self.vm.string(id)));
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdArgcL | InternalOp::LdArgcS => {
                    let target = read_local(code, args);
                    let argc = self.cur().argc as i64;
                    self.write_slot(target, Value::Int(argc));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::ONE_LOCAL_SIZE;
                }
                InternalOp::LdEnumL | InternalOp::LdEnumS => {
                    let target = read_local(code, args);
                    let type_id = TypeId(read_u32(code, args + 4));
                    let value = read_i64(code, args + 8);
                    self.write_slot(target, Value::Enum(type_id, value));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOAD_ENUM_SIZE;
                }

                InternalOp::NewObjL | InternalOp::NewObjS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let type_id = TypeId(read_u32(code, args + 12));
                    let args_slot = self.slot_of(args_off);
                    let instance = self.construct_ll(type_id, argc, args_slot)?;
                    self.cur_mut().stack_count -= argc;
                    self.write_slot(target, instance);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::NEW_OBJECT_SIZE;
                }
                InternalOp::ListL | InternalOp::ListS => {
                    let target = read_local(code, args);
                    let capacity = read_i32(code, args + 4);
                    let value = self.make_list(capacity)?;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::HashL | InternalOp::HashS => {
                    let target = read_local(code, args);
                    let capacity = read_i32(code, args + 4);
                    let value = self.make_hash(capacity)?;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }

                InternalOp::LdFldL
                | InternalOp::LdFldS
                | InternalOp::LdFldFastL
                | InternalOp::LdFldFastS => {
                    let instance_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let field = ovum_core::FieldId(read_u32(code, args + 8));
                    let instance = self.read_slot(instance_off);
                    let checked = matches!(opcode, InternalOp::LdFldL | InternalOp::LdFldS);
                    let value = self.load_field_ll(&instance, field, checked)?;
                    self.cur_mut().stack_count -= 1;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_AND_ID_SIZE;
                }
                InternalOp::StFld | InternalOp::StFldFast => {
                    let args_off = read_local(code, args);
                    let field = ovum_core::FieldId(read_u32(code, args + 4));
                    let args_slot = self.slot_of(args_off);
                    let instance = self.stack[args_slot].clone();
                    let value = self.stack[args_slot + 1].clone();
                    self.store_field_ll(&instance, field, value, opcode == InternalOp::StFld)?;
                    self.cur_mut().stack_count -= 2;
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdSFldL | InternalOp::LdSFldS => {
                    let target = read_local(code, args);
                    let field = ovum_core::FieldId(read_u32(code, args + 4));
                    let value = self.static_field_cell(field).read();
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::StSFldL | InternalOp::StSFldS => {
                    let value_off = read_local(code, args);
                    let field = ovum_core::FieldId(read_u32(code, args + 4));
                    let value = self.read_slot(value_off);
                    self.static_field_cell(field).write(value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }

                InternalOp::LdMemL | InternalOp::LdMemS => {
                    let instance_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let member = StrId(read_u32(code, args + 8));
                    let instance_slot = self.slot_of(instance_off);
                    let value = self.load_member_ll(instance_slot, member)?;
                    self.cur_mut().stack_count -= 1;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_AND_ID_SIZE;
                }
                InternalOp::StMem => {
                    let args_off = read_local(code, args);
                    let member = StrId(read_u32(code, args + 4));
                    let args_slot = self.slot_of(args_off);
                    self.store_member_ll(args_slot, member)?;
                    self.cur_mut().stack_count -= 2;
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdIterL | InternalOp::LdIterS => {
                    let instance_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let instance_slot = self.slot_of(instance_off);
                    let name = self.vm.gc().intern(ITERATOR_MEMBER);
                    let value = self.invoke_member_by_name(&name, 0, instance_slot, 0)?;
                    self.cur_mut().stack_count -= 1;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }
                InternalOp::LdTypeL | InternalOp::LdTypeS => {
                    let source = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let value = self.read_slot(source);
                    let token = match self.vm.value_type_id(&value) {
                        Some(ty) => self.make_type_token(ty)?,
                        None => Value::Null,
                    };
                    self.cur_mut().stack_count -= 1;
                    self.write_slot(target, token);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }
                InternalOp::LdIdxL | InternalOp::LdIdxS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let args_slot = self.slot_of(args_off);
                    let value = self.load_indexer_ll(argc, args_slot)?;
                    self.cur_mut().stack_count -= argc + 1;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_AND_ID_SIZE;
                }
                InternalOp::StIdx => {
                    let args_off = read_local(code, args);
                    let argc = read_u32(code, args + 4);
                    let args_slot = self.slot_of(args_off);
                    self.store_indexer_ll(argc, args_slot)?;
                    self.cur_mut().stack_count -= argc + 2;
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdSfnL | InternalOp::LdSfnS => {
                    let target = read_local(code, args);
                    let method = MethodId(read_u32(code, args + 4));
                    let value = self.make_bound_method(Value::Null, method)?;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdTypeTknL | InternalOp::LdTypeTknS => {
                    let target = read_local(code, args);
                    let type_id = TypeId(read_u32(code, args + 4));
                    let value = self.make_type_token(type_id)?;
                    self.write_slot(target, value);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }

                InternalOp::CallL | InternalOp::CallS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let value_slot = self.slot_of(args_off);
                    let result = self.invoke_ll(argc, value_slot, 0)?;
                    self.cur_mut().stack_count -= argc + 1;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::CALL_SIZE;
                }
                InternalOp::CallRL | InternalOp::CallRS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let ref_signature = read_u32(code, args + 12);
                    let value_slot = self.slot_of(args_off);
                    let result = self.invoke_ll(argc, value_slot, ref_signature)?;
                    self.cur_mut().stack_count -= argc + 1;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::CALL_REF_SIZE;
                }
                InternalOp::ScallL | InternalOp::ScallS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let method = MethodId(read_u32(code, args + 12));
                    let overload_index = read_u32(code, args + 16);
                    let overload =
                        Arc::clone(&self.vm.method(method).overloads[overload_index as usize]);
                    let args_slot = self.slot_of(args_off);
                    let result = self.invoke_method_overload(&overload, argc, args_slot)?;
                    self.cur_mut().stack_count -= argc + overload.instance_offset();
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::STATIC_CALL_SIZE;
                }
                InternalOp::CallMemL | InternalOp::CallMemS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let member = StrId(read_u32(code, args + 12));
                    let value_slot = self.slot_of(args_off);
                    let name = Arc::clone(self.vm.string(member));
                    let result = self.invoke_member_by_name(&name, argc, value_slot, 0)?;
                    self.cur_mut().stack_count -= argc + 1;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::CALL_MEMBER_SIZE;
                }
                InternalOp::CallMemRL | InternalOp::CallMemRS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let argc = read_u32(code, args + 8);
                    let ref_signature = read_u32(code, args + 12);
                    let member = StrId(read_u32(code, args + 16));
                    let value_slot = self.slot_of(args_off);
                    let name = Arc::clone(self.vm.string(member));
                    let result =
                        self.invoke_member_by_name(&name, argc, value_slot, ref_signature)?;
                    self.cur_mut().stack_count -= argc + 1;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::CALL_MEMBER_REF_SIZE;
                }
                InternalOp::ApplyL | InternalOp::ApplyS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let args_slot = self.slot_of(args_off);
                    let result = self.invoke_apply_ll(args_slot)?;
                    self.cur_mut().stack_count -= 2;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }
                InternalOp::SapplyL | InternalOp::SapplyS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let method = MethodId(read_u32(code, args + 8));
                    let args_slot = self.slot_of(args_off);
                    let result = self.invoke_apply_method_ll(method, args_slot)?;
                    self.cur_mut().stack_count -= 1;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::STATIC_APPLY_SIZE;
                }

                InternalOp::Br => {
                    let rel = read_i32(code, args);
                    cursor = offset_by(args + oa::BRANCH_SIZE, rel);
                }
                InternalOp::Leave => {
                    let rel = read_i32(code, args);
                    self.evaluate_leave(rel)?;
                    cursor = offset_by(args + oa::BRANCH_SIZE, rel);
                }
                InternalOp::BrNullL | InternalOp::BrNullS => {
                    let value = self.read_slot(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    cursor = if value == Value::Null {
                        offset_by(end, rel)
                    } else {
                        end
                    };
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                }
                InternalOp::BrInstL | InternalOp::BrInstS => {
                    let value = self.read_slot(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    cursor = if value != Value::Null {
                        offset_by(end, rel)
                    } else {
                        end
                    };
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                }
                InternalOp::BrFalseL | InternalOp::BrFalseS => {
                    let value = self.read_slot(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    cursor = if value.is_false() {
                        offset_by(end, rel)
                    } else {
                        end
                    };
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                }
                InternalOp::BrTrueL | InternalOp::BrTrueS => {
                    let value = self.read_slot(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    cursor = if value.is_true() {
                        offset_by(end, rel)
                    } else {
                        end
                    };
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                }
                InternalOp::BrTypeL | InternalOp::BrTypeS => {
                    let value = self.read_slot(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let type_id = TypeId(read_u32(code, args + 8));
                    let end = args + oa::BRANCH_IF_TYPE_SIZE;
                    cursor = if self.vm.value_is_type(&value, type_id) {
                        offset_by(end, rel)
                    } else {
                        end
                    };
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                }
                InternalOp::SwitchL | InternalOp::SwitchS => {
                    let value = self.read_slot(read_local(code, args));
                    let count = read_u32(code, args + 4) as usize;
                    let end = args + oa::switch_size(count);
                    let Value::Int(selector) = value else {
                        return self.throw_type_error("switch requires an Int selector");
                    };
                    cursor = if selector >= 0 && (selector as usize) < count {
                        let rel = read_i32(code, args + 8 + 4 * selector as usize);
                        offset_by(end, rel)
                    } else {
                        end
                    };
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                }
                InternalOp::BrRef | InternalOp::BrNRef => {
                    let args_slot = self.slot_of(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    let same = self.stack[args_slot].same_reference(&self.stack[args_slot + 1]);
                    let jump = same == (opcode == InternalOp::BrRef);
                    self.cur_mut().stack_count -= 2;
                    cursor = if jump { offset_by(end, rel) } else { end };
                }

                InternalOp::OperatorL
                | InternalOp::OperatorS
                | InternalOp::UnaryOpL
                | InternalOp::UnaryOpS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let op = Operator::try_from(read_u32(code, args + 8) as u8)
                        .expect("corrupt operator operand");
                    let arity = op.arity();
                    let args_slot = self.slot_of(args_off);
                    let result = self.invoke_operator_ll(args_slot, op, arity)?;
                    self.cur_mut().stack_count -= arity;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::OPERATOR_SIZE;
                }
                InternalOp::EqL | InternalOp::EqS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let args_slot = self.slot_of(args_off);
                    let eq = self.equals_ll(args_slot)?;
                    self.cur_mut().stack_count -= 2;
                    self.write_slot(target, Value::Bool(eq));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }
                InternalOp::CmpL | InternalOp::CmpS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let args_slot = self.slot_of(args_off);
                    let ord = self.compare_ll(args_slot)?;
                    self.cur_mut().stack_count -= 2;
                    self.write_slot(target, Value::Int(ord));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }
                InternalOp::LtL | InternalOp::LtS => {
                    cursor = self.compare_to_bool(code, args, opcode, |ord| ord < 0)?;
                }
                InternalOp::GtL | InternalOp::GtS => {
                    cursor = self.compare_to_bool(code, args, opcode, |ord| ord > 0)?;
                }
                InternalOp::LteL | InternalOp::LteS => {
                    cursor = self.compare_to_bool(code, args, opcode, |ord| ord <= 0)?;
                }
                InternalOp::GteL | InternalOp::GteS => {
                    cursor = self.compare_to_bool(code, args, opcode, |ord| ord >= 0)?;
                }
                InternalOp::ConcatL | InternalOp::ConcatS => {
                    let args_off = read_local(code, args);
                    let target = read_local(code, args + 4);
                    let args_slot = self.slot_of(args_off);
                    let result = self.concat_ll(args_slot)?;
                    self.cur_mut().stack_count -= 2;
                    self.write_slot(target, result);
                    if opcode.low_bit() {
                        self.cur_mut().stack_count += 1;
                    }
                    cursor = args + oa::TWO_LOCALS_SIZE;
                }

                // Fused compare-and-branch.
                InternalOp::BrEq | InternalOp::BrNeq => {
                    let args_slot = self.slot_of(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    let eq = self.equals_ll(args_slot)?;
                    self.cur_mut().stack_count -= 2;
                    let jump = eq == (opcode == InternalOp::BrEq);
                    cursor = if jump { offset_by(end, rel) } else { end };
                }
                InternalOp::BrLt | InternalOp::BrGt | InternalOp::BrLte | InternalOp::BrGte => {
                    let args_slot = self.slot_of(read_local(code, args));
                    let rel = read_i32(code, args + 4);
                    let end = args + oa::COND_BRANCH_SIZE;
                    let ord = self.compare_ll(args_slot)?;
                    self.cur_mut().stack_count -= 2;
                    let jump = match opcode {
                        InternalOp::BrLt => ord < 0,
                        InternalOp::BrGt => ord > 0,
                        InternalOp::BrLte => ord <= 0,
                        _ => ord >= 0,
                    };
                    cursor = if jump { offset_by(end, rel) } else { end };
                }

                InternalOp::Throw => {
                    return self.throw(false);
                }
                InternalOp::Rethrow => {
                    return self.throw(true);
                }
                InternalOp::EndFinally => {
                    // Reached through the error-handler or leave machinery;
                    // return and let it continue its search.
                    return Ok(());
                }

                InternalOp::LdLocRef => {
                    let local = read_local(code, args);
                    let slot = self.slot_of(local);
                    self.push(Value::LocalRef(slot))?;
                    cursor = args + oa::ONE_LOCAL_SIZE;
                }
                InternalOp::LdMemRefL | InternalOp::LdMemRefS => {
                    let instance = self.read_slot(read_local(code, args));
                    let member = StrId(read_u32(code, args + 4));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                    let reference = self.load_member_ref_ll(&instance, member)?;
                    self.push(reference)?;
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdFldRefL | InternalOp::LdFldRefS => {
                    let instance = self.read_slot(read_local(code, args));
                    let field = ovum_core::FieldId(read_u32(code, args + 4));
                    if opcode.low_bit() {
                        self.cur_mut().stack_count -= 1;
                    }
                    let reference = self.load_field_ref_ll(&instance, field)?;
                    self.push(reference)?;
                    cursor = args + oa::LOCAL_AND_ID_SIZE;
                }
                InternalOp::LdSFldRef => {
                    let field = ovum_core::FieldId(read_u32(code, args));
                    let id = match self.vm.field(field).storage {
                        FieldStorage::Static(id) => id,
                        FieldStorage::Instance(_) => {
                            panic!("ldsfldref on an instance field")
                        }
                    };
                    self.push(Value::StaticRef(id))?;
                    cursor = args + oa::SINGLE_ID_SIZE;
                }
            }
        }
    }

    /// Shared tail of the `lt`/`gt`/`lte`/`gte` handlers.
    fn compare_to_bool(
        &mut self,
        code: &[u8],
        args: usize,
        opcode: InternalOp,
        test: fn(i64) -> bool,
    ) -> Result<usize, Abort> {
        let args_off = read_local(code, args);
        let target = read_local(code, args + 4);
        let args_slot = self.slot_of(args_off);
        let ord = self.compare_ll(args_slot)?;
        self.cur_mut().stack_count -= 2;
        self.write_slot(target, Value::Bool(test(ord)));
        if opcode.low_bit() {
            self.cur_mut().stack_count += 1;
        }
        Ok(args + oa::TWO_LOCALS_SIZE)
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    pub(crate) fn read_through_ref(&self, cell: &Value) -> Value {
        match cell {
            Value::LocalRef(slot) => self.stack[*slot].clone(),
            Value::StaticRef(id) => self.vm.static_ref(*id).read(),
            Value::FieldRef { object, field } => self
                .vm
                .gc()
                .read_field(*object, *field)
                .expect("field reference to a dead object"),
            _ => panic!("value is not a reference"),
        }
    }

    fn write_through_ref(&mut self, cell: &Value, value: Value) {
        match cell {
            Value::LocalRef(slot) => self.stack[*slot] = value,
            Value::StaticRef(id) => self.vm.static_ref(*id).write(value),
            Value::FieldRef { object, field } => {
                if !self.vm.gc().write_field(*object, *field, value) {
                    panic!("field reference to a dead object");
                }
            }
            _ => panic!("value is not a reference"),
        }
    }

    fn load_member_ref_ll(&mut self, instance: &Value, member: StrId) -> Result<Value, Abort> {
        if *instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let name = vm.string(member);
        let Some(ty) = vm.value_type_id(instance) else {
            return self.throw_type_error("the value has no members");
        };
        let Some((_, found)) = vm.lookup_member(ty, name) else {
            return self.throw_member_not_found_error(name);
        };
        match found.kind {
            MemberKind::Field(field) => self.load_field_ref_ll(instance, field),
            _ => self.throw_type_error("only fields can be passed by reference"),
        }
    }

    fn load_field_ref_ll(
        &mut self,
        instance: &Value,
        field: ovum_core::FieldId,
    ) -> Result<Value, Abort> {
        if *instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let info = vm.field(field);
        let index = info.instance_index();
        if let Some(decl) = info.decl_type {
            if !vm.value_is_type(instance, decl) {
                return self.throw_type_error("the field does not belong to this value");
            }
        }
        let Value::Object { handle, .. } = instance else {
            return self.throw_type_error("primitive values have no fields");
        };
        Ok(Value::FieldRef {
            object: *handle,
            field: index,
        })
    }

    // ------------------------------------------------------------------
    // Field, member and indexer access
    // ------------------------------------------------------------------

    fn static_field_cell(&self, field: ovum_core::FieldId) -> &crate::runtime::module::StaticRef {
        match self.vm.field(field).storage {
            FieldStorage::Static(id) => self.vm.static_ref(id),
            FieldStorage::Instance(_) => panic!("static access to an instance field"),
        }
    }

    fn load_field_ll(
        &mut self,
        instance: &Value,
        field: ovum_core::FieldId,
        check_type: bool,
    ) -> Result<Value, Abort> {
        if *instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let info = vm.field(field);
        if check_type {
            if let Some(decl) = info.decl_type {
                if !vm.value_is_type(instance, decl) {
                    return self.throw_type_error("the field does not belong to this value");
                }
            }
        }
        let Value::Object { handle, .. } = instance else {
            return self.throw_type_error("primitive values have no fields");
        };
        match vm.gc().read_field(*handle, info.instance_index()) {
            Some(value) => Ok(value),
            None => self.throw_type_error("the field does not belong to this value"),
        }
    }

    fn store_field_ll(
        &mut self,
        instance: &Value,
        field: ovum_core::FieldId,
        value: Value,
        check_type: bool,
    ) -> Result<(), Abort> {
        if *instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let info = vm.field(field);
        if check_type {
            if let Some(decl) = info.decl_type {
                if !vm.value_is_type(instance, decl) {
                    return self.throw_type_error("the field does not belong to this value");
                }
            }
        }
        let Value::Object { handle, .. } = instance else {
            return self.throw_type_error("primitive values have no fields");
        };
        if !vm.gc().write_field(*handle, info.instance_index(), value) {
            return self.throw_type_error("the field does not belong to this value");
        }
        Ok(())
    }

    /// Loads the named member of the value at `instance_slot`: a field's
    /// value, a property getter's result, or a bound Method object.
    fn load_member_ll(&mut self, instance_slot: usize, member: StrId) -> Result<Value, Abort> {
        let instance = self.stack[instance_slot].clone();
        if instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let name = Arc::clone(vm.string(member));
        let Some(ty) = vm.value_type_id(&instance) else {
            return self.throw_type_error("the value has no members");
        };
        let Some((_, found)) = vm.lookup_member(ty, &name) else {
            return self.throw_member_not_found_error(&name);
        };
        match found.kind {
            MemberKind::Field(field) => self.load_field_ll(&instance, field, true),
            MemberKind::Property { getter, .. } => {
                let Some(getter) = getter else {
                    return self.throw_type_error("the property has no getter");
                };
                self.invoke_group_on(getter, 0, instance_slot)
            }
            MemberKind::Method(method) => self.make_bound_method(instance, method),
        }
    }

    /// Stores `[instance, value]` at `args_slot` into the named member.
    fn store_member_ll(&mut self, args_slot: usize, member: StrId) -> Result<(), Abort> {
        let instance = self.stack[args_slot].clone();
        if instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let name = Arc::clone(vm.string(member));
        let Some(ty) = vm.value_type_id(&instance) else {
            return self.throw_type_error("the value has no members");
        };
        let Some((_, found)) = vm.lookup_member(ty, &name) else {
            return self.throw_member_not_found_error(&name);
        };
        match found.kind {
            MemberKind::Field(field) => {
                let value = self.stack[args_slot + 1].clone();
                self.store_field_ll(&instance, field, value, true)
            }
            MemberKind::Property { setter, .. } => {
                let Some(setter) = setter else {
                    return self.throw_type_error("the property has no setter");
                };
                self.invoke_group_on(setter, 1, args_slot).map(|_| ())
            }
            MemberKind::Method(_) => self.throw_type_error("a method cannot be assigned to"),
        }
    }

    fn load_indexer_ll(&mut self, argc: u32, args_slot: usize) -> Result<Value, Abort> {
        let instance = self.stack[args_slot].clone();
        if instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let Some(ty) = vm.value_type_id(&instance) else {
            return self.throw_type_error("the value has no indexer");
        };
        let Some((_, found)) = vm.lookup_member(ty, INDEXER_MEMBER) else {
            return self.throw_type_error("the value has no indexer");
        };
        match found.kind {
            MemberKind::Property {
                getter: Some(getter),
                ..
            } => self.invoke_group_on(getter, argc, args_slot),
            _ => self.throw_type_error("the value has no readable indexer"),
        }
    }

    fn store_indexer_ll(&mut self, argc: u32, args_slot: usize) -> Result<(), Abort> {
        let instance = self.stack[args_slot].clone();
        if instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let Some(ty) = vm.value_type_id(&instance) else {
            return self.throw_type_error("the value has no indexer");
        };
        let Some((_, found)) = vm.lookup_member(ty, INDEXER_MEMBER) else {
            return self.throw_type_error("the value has no indexer");
        };
        match found.kind {
            MemberKind::Property {
                setter: Some(setter),
                ..
            } => self.invoke_group_on(setter, argc + 1, args_slot).map(|_| ()),
            _ => self.throw_type_error("the value has no writable indexer"),
        }
    }

    /// Invokes an instance method group whose instance sits at `args_slot`,
    /// followed by `argc` arguments.
    fn invoke_group_on(
        &mut self,
        method: MethodId,
        argc: u32,
        args_slot: usize,
    ) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let Some((_, overload)) = vm.method(method).resolve_overload(argc) else {
            return self.throw_no_overload_error(argc);
        };
        let overload = Arc::clone(overload);
        self.invoke_method_overload(&overload, argc, args_slot)
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Invokes the value at `value_slot` with `argc` arguments above it.
    /// Today only bound `aves.Method` objects are invokable.
    fn invoke_ll(
        &mut self,
        argc: u32,
        value_slot: usize,
        ref_signature: u32,
    ) -> Result<Value, Abort> {
        let value = self.stack[value_slot].clone();
        let vm = Arc::clone(&self.vm);
        if !vm.value_is_type(&value, vm.standard.method) {
            return self.throw_type_error("the value is not invokable");
        }
        let Value::Object { handle, .. } = value else {
            return self.throw_type_error("the value is not invokable");
        };
        let instance = vm
            .gc()
            .read_field(handle, 0)
            .expect("Method object lost its instance field");
        let Some(Value::FnRef(method)) = vm.gc().read_field(handle, 1) else {
            panic!("Method object lost its target field");
        };

        let Some((_, overload)) = vm.method(method).resolve_overload(argc) else {
            return self.throw_no_overload_error(argc);
        };
        let overload = Arc::clone(overload);
        if let Some(arg) =
            overload.verify_ref_signature(ref_signature, argc, vm.ref_signatures())
        {
            let declared = vm
                .ref_signatures()
                .is_param_ref(overload.ref_signature, arg + 1);
            return self.throw_type_error(&format!(
                "argument {arg} must be passed {}",
                if declared { "by reference" } else { "by value" }
            ));
        }

        if overload.is_instance() {
            // The instance takes the invoked value's place.
            self.stack[value_slot] = instance;
            self.invoke_method_overload(&overload, argc, value_slot)
        } else {
            self.invoke_method_overload(&overload, argc, value_slot + 1)
        }
    }

    /// Invokes the named member of the value at `value_slot`, with `argc`
    /// arguments above it. Non-method members are loaded first, so a
    /// property getter may run.
    fn invoke_member_by_name(
        &mut self,
        name: &Arc<str>,
        argc: u32,
        value_slot: usize,
        ref_signature: u32,
    ) -> Result<Value, Abort> {
        let instance = self.stack[value_slot].clone();
        if instance == Value::Null {
            return self.throw_null_reference_error();
        }
        let vm = Arc::clone(&self.vm);
        let Some(ty) = vm.value_type_id(&instance) else {
            return self.throw_type_error("the value has no members");
        };
        let Some((_, found)) = vm.lookup_member(ty, name) else {
            return self.throw_member_not_found_error(name);
        };
        match found.kind {
            MemberKind::Method(method) => {
                let Some((_, overload)) = vm.method(method).resolve_overload(argc) else {
                    return self.throw_no_overload_error(argc);
                };
                let overload = Arc::clone(overload);
                if let Some(arg) =
                    overload.verify_ref_signature(ref_signature, argc, vm.ref_signatures())
                {
                    let declared = vm
                        .ref_signatures()
                        .is_param_ref(overload.ref_signature, arg + 1);
                    return self.throw_type_error(&format!(
                        "argument {arg} must be passed {}",
                        if declared { "by reference" } else { "by value" }
                    ));
                }
                self.invoke_method_overload(&overload, argc, value_slot)
            }
            MemberKind::Field(field) => {
                let value = self.load_field_ll(&instance, field, true)?;
                self.stack[value_slot] = value;
                self.invoke_ll(argc, value_slot, ref_signature)
            }
            MemberKind::Property { getter, .. } => {
                let Some(getter) = getter else {
                    return self.throw_type_error("the property has no getter");
                };
                // The pending arguments sit right above the instance, so the
                // getter runs on a copy of the instance at the stack top.
                let top = self.cur().next_slot();
                self.ensure_capacity(top + 1)?;
                self.stack[top] = instance;
                self.cur_mut().stack_count += 1;
                let loaded = self.invoke_group_on(getter, 0, top);
                self.cur_mut().stack_count -= 1;
                self.stack[value_slot] = loaded?;
                self.invoke_ll(argc, value_slot, ref_signature)
            }
        }
    }

    /// Spreads `[value, list]` at `args_slot` into an invocation of the
    /// value.
    fn invoke_apply_ll(&mut self, args_slot: usize) -> Result<Value, Abort> {
        let argc = self.spread_list(args_slot + 1)?;
        self.invoke_ll(argc, args_slot, 0)
    }

    /// Spreads `[list]` at `args_slot` into an invocation of a static method
    /// group, resolving the overload from the list's length.
    fn invoke_apply_method_ll(
        &mut self,
        method: MethodId,
        args_slot: usize,
    ) -> Result<Value, Abort> {
        let argc = self.spread_list(args_slot)?;
        let vm = Arc::clone(&self.vm);
        let Some((_, overload)) = vm.method(method).resolve_overload(argc) else {
            return self.throw_no_overload_error(argc);
        };
        let overload = Arc::clone(overload);
        self.invoke_method_overload(&overload, argc, args_slot)
    }

    /// Replaces the List at `list_slot` with its elements, laid out
    /// consecutively from that slot. Returns the element count.
    fn spread_list(&mut self, list_slot: usize) -> Result<u32, Abort> {
        let vm = Arc::clone(&self.vm);
        let list = self.stack[list_slot].clone();
        if !vm.value_is_type(&list, vm.standard.list) {
            return self.throw_type_error("apply requires a List of arguments");
        }
        let Value::Object { handle, .. } = list else {
            return self.throw_type_error("apply requires a List of arguments");
        };
        let elements: Vec<Value> = vm
            .gc()
            .with_body(handle, |body| match body {
                ObjectBody::List(values) => values.clone(),
                _ => Vec::new(),
            })
            .expect("List object lost its storage");

        self.ensure_capacity(list_slot + elements.len())?;
        for (i, element) in elements.iter().enumerate() {
            self.stack[list_slot + i] = element.clone();
        }
        Ok(elements.len() as u32)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    /// Looks up and invokes the operator implementation through the first
    /// argument's type.
    fn invoke_operator_ll(
        &mut self,
        args_slot: usize,
        op: Operator,
        arity: u32,
    ) -> Result<Value, Abort> {
        let first = self.stack[args_slot].clone();
        let vm = Arc::clone(&self.vm);
        let Some(ty) = vm.value_type_id(&first) else {
            return self.throw_type_error(&format!("operator {} is not defined for null", op.name()));
        };
        let Some(method) = vm.lookup_operator(ty, op) else {
            let type_name = Arc::clone(&vm.type_info(ty).name);
            return self.throw_type_error(&format!(
                "{type_name} does not support the {} operator",
                op.name()
            ));
        };
        let Some((_, overload)) = vm.method(method).resolve_overload(arity) else {
            return self.throw_no_overload_error(arity);
        };
        let overload = Arc::clone(overload);
        self.invoke_method_overload(&overload, arity, args_slot)
    }

    fn equals_ll(&mut self, args_slot: usize) -> Result<bool, Abort> {
        // Null never dispatches: null equals only null.
        let a_null = self.stack[args_slot] == Value::Null;
        let b_null = self.stack[args_slot + 1] == Value::Null;
        if a_null || b_null {
            return Ok(a_null && b_null);
        }
        let result = self.invoke_operator_ll(args_slot, Operator::Eq, 2)?;
        Ok(result.is_true())
    }

    fn compare_ll(&mut self, args_slot: usize) -> Result<i64, Abort> {
        let result = self.invoke_operator_ll(args_slot, Operator::Cmp, 2)?;
        match result {
            Value::Int(ord) => Ok(ord),
            _ => self.throw_type_error("the <=> operator must return an Int"),
        }
    }

    fn concat_ll(&mut self, args_slot: usize) -> Result<Value, Abort> {
        let left = self.stack[args_slot].clone();
        let right = self.stack[args_slot + 1].clone();
        let left = self.to_string_value(&left)?;
        let right = self.to_string_value(&right)?;
        let mut out = String::with_capacity(left.len() + right.len());
        out.push_str(&left);
        out.push_str(&right);
        Ok(Value::Str(Arc::from(out.as_str())))
    }

    /// Converts a value to a string, calling its `toString` member for
    /// objects that have one.
    fn to_string_value(&mut self, value: &Value) -> Result<Arc<str>, Abort> {
        let vm = Arc::clone(&self.vm);
        match value {
            Value::Null => Ok(Arc::from("")),
            Value::Bool(b) => Ok(Arc::from(if *b { "true" } else { "false" })),
            Value::Int(i) => Ok(Arc::from(i.to_string().as_str())),
            Value::UInt(u) => Ok(Arc::from(u.to_string().as_str())),
            Value::Real(r) => Ok(Arc::from(r.to_string().as_str())),
            Value::Str(s) => Ok(Arc::clone(s)),
            Value::Enum(_, v) => Ok(Arc::from(v.to_string().as_str())),
            Value::Object { type_id, .. } => {
                if vm.lookup_member(*type_id, TO_STRING_MEMBER).is_some() {
                    let top = self.cur().next_slot();
                    self.ensure_capacity(top + 1)?;
                    self.stack[top] = value.clone();
                    self.cur_mut().stack_count += 1;
                    let name: Arc<str> = Arc::from(TO_STRING_MEMBER);
                    let result = self.invoke_member_by_name(&name, 0, top, 0);
                    self.cur_mut().stack_count -= 1;
                    match result? {
                        Value::Str(s) => Ok(s),
                        _ => self.throw_type_error("toString must return a String"),
                    }
                } else {
                    Ok(Arc::clone(&vm.type_info(*type_id).name))
                }
            }
            _ => self.throw_type_error("the value cannot be converted to a string"),
        }
    }

    // ------------------------------------------------------------------
    // Object construction and library objects
    // ------------------------------------------------------------------

    /// Allocates an instance of `type_id` and runs its constructor with the
    /// `argc` arguments at `args_slot`. The arguments are shifted up one
    /// slot to make room for the instance.
    fn construct_ll(
        &mut self,
        type_id: TypeId,
        argc: u32,
        args_slot: usize,
    ) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let info = vm.type_info(type_id);
        let handle = match vm.gc().alloc_fields(type_id, info.field_count) {
            Ok(handle) => handle,
            Err(_) => return self.throw_memory_error(),
        };
        let instance = Value::Object { type_id, handle };

        self.ensure_capacity(args_slot + argc as usize + 1)?;
        for i in (0..argc as usize).rev() {
            self.stack[args_slot + 1 + i] = self.stack[args_slot + i].clone();
        }
        self.stack[args_slot] = instance.clone();

        let ctor = info
            .instance_ctor
            .expect("constructible type lost its constructor");
        let (_, overload) = vm
            .method(ctor)
            .resolve_overload(argc)
            .expect("constructor overload vanished after initialization");
        let overload = Arc::clone(overload);
        self.invoke_method_overload(&overload, argc, args_slot)?;
        Ok(instance)
    }

    fn make_list(&mut self, capacity: i32) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let handle = match vm.gc().alloc_fields(vm.standard.list, 0) {
            Ok(handle) => handle,
            Err(_) => return self.throw_memory_error(),
        };
        (vm.functions.init_list)(self, handle, capacity)?;
        Ok(Value::Object {
            type_id: vm.standard.list,
            handle,
        })
    }

    fn make_hash(&mut self, capacity: i32) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let handle = match vm.gc().alloc_fields(vm.standard.hash, 0) {
            Ok(handle) => handle,
            Err(_) => return self.throw_memory_error(),
        };
        (vm.functions.init_hash)(self, handle, capacity)?;
        Ok(Value::Object {
            type_id: vm.standard.hash,
            handle,
        })
    }

    fn make_type_token(&mut self, wrapped: TypeId) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let handle = match vm.gc().alloc_fields(vm.standard.type_token, 1) {
            Ok(handle) => handle,
            Err(_) => return self.throw_memory_error(),
        };
        (vm.functions.init_type_token)(self, handle, wrapped)?;
        Ok(Value::Object {
            type_id: vm.standard.type_token,
            handle,
        })
    }

    /// Builds an `aves.Method` object binding `instance` to `method`.
    fn make_bound_method(&mut self, instance: Value, method: MethodId) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let handle = match vm.gc().alloc_fields(vm.standard.method, 2) {
            Ok(handle) => handle,
            Err(_) => return self.throw_memory_error(),
        };
        vm.gc().write_field(handle, 0, instance);
        vm.gc().write_field(handle, 1, Value::FnRef(method));
        Ok(Value::Object {
            type_id: vm.standard.method,
            handle,
        })
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    /// Throws the value on top of the stack, or rethrows the error being
    /// handled. A thrown value that is not an `aves.Error` is wrapped in one
    /// with the value in its data member. The error's stack trace is set
    /// unless rethrowing.
    pub fn throw(&mut self, rethrow: bool) -> Result<(), Abort> {
        if !rethrow {
            let value = self.pop();
            let vm = Arc::clone(&self.vm);
            let error = if vm.value_is_type(&value, vm.standard.error) {
                value
            } else {
                let wrapped = self.make_error(vm.standard.error, "An error occurred.")?;
                if let Value::Object { handle, .. } = &wrapped {
                    vm.gc().write_field(*handle, error_fields::DATA, value);
                }
                wrapped
            };
            if let Value::Object { handle, .. } = &error {
                let trace = StackTraceFormatter::format(self);
                vm.gc().write_field(
                    *handle,
                    error_fields::STACK_TRACE,
                    Value::Str(Arc::from(trace.as_str())),
                );
            }
            self.current_error = error;
        }
        Err(Abort::Thrown)
    }

    /// Allocates an error object of `type_id` with the given message. When
    /// even that allocation fails the thread dies with a fatal
    /// out-of-memory.
    fn make_error(&mut self, type_id: TypeId, message: &str) -> Result<Value, Abort> {
        let vm = Arc::clone(&self.vm);
        let field_count = vm.type_info(type_id).field_count;
        let handle = match vm.gc().alloc_fields(type_id, field_count) {
            Ok(handle) => handle,
            Err(_) => {
                if type_id == vm.standard.memory_error {
                    return Err(Abort::Fatal(VmError::OutOfMemory));
                }
                return self.throw_memory_error();
            }
        };
        vm.gc().write_field(
            handle,
            error_fields::MESSAGE,
            Value::Str(Arc::from(message)),
        );
        Ok(Value::Object { type_id, handle })
    }

    fn throw_error_of<T>(&mut self, type_id: TypeId, message: &str) -> Result<T, Abort> {
        let error = self.make_error(type_id, message)?;
        if let Value::Object { handle, .. } = &error {
            let trace = StackTraceFormatter::format(self);
            self.vm.gc().write_field(
                *handle,
                error_fields::STACK_TRACE,
                Value::Str(Arc::from(trace.as_str())),
            );
        }
        self.current_error = error;
        Err(Abort::Thrown)
    }

    pub fn throw_error<T>(&mut self, message: &str) -> Result<T, Abort> {
        let ty = self.vm.standard.error;
        self.throw_error_of(ty, message)
    }

    pub fn throw_type_error<T>(&mut self, message: &str) -> Result<T, Abort> {
        let ty = self.vm.standard.type_error;
        self.throw_error_of(ty, message)
    }

    pub fn throw_memory_error<T>(&mut self) -> Result<T, Abort> {
        let ty = self.vm.standard.memory_error;
        self.throw_error_of(ty, "there is not enough memory available")
    }

    pub fn throw_overflow_error<T>(&mut self) -> Result<T, Abort> {
        let ty = self.vm.standard.overflow_error;
        self.throw_error_of(ty, "the arithmetic operation overflowed")
    }

    pub fn throw_divide_by_zero_error<T>(&mut self) -> Result<T, Abort> {
        let ty = self.vm.standard.divide_by_zero_error;
        self.throw_error_of(ty, "cannot divide by zero")
    }

    pub fn throw_null_reference_error<T>(&mut self) -> Result<T, Abort> {
        let ty = self.vm.standard.null_reference_error;
        self.throw_error_of(ty, "a null value cannot be used here")
    }

    pub fn throw_type_conversion_error<T>(&mut self, message: &str) -> Result<T, Abort> {
        let ty = self.vm.standard.type_conversion_error;
        self.throw_error_of(ty, message)
    }

    pub fn throw_member_not_found_error<T>(&mut self, member: &str) -> Result<T, Abort> {
        let ty = self.vm.standard.member_not_found_error;
        self.throw_error_of(ty, &format!("the member '{member}' could not be found"))
    }

    pub fn throw_no_overload_error<T>(&mut self, argc: u32) -> Result<T, Abort> {
        let ty = self.vm.standard.no_overload_error;
        self.throw_error_of(
            ty,
            &format!("no overload accepts {argc} argument(s)"),
        )
    }

    /// Scans the current frame's try blocks (innermost first) for a handler
    /// covering the current instruction. Catch: the stack is reset to the
    /// error alone and the IP moved to the catch start. Finally: the clause
    /// runs with the in-flight error saved on the thread's error stack, and
    /// the search continues afterwards.
    ///
    /// `max_index` bounds the scan: an error thrown inside a finally clause
    /// is only handled by try blocks strictly outside the one whose clause
    /// is running.
    fn find_error_handler(&mut self, max_index: Option<usize>) -> Result<(), Abort> {
        let body: Arc<InitializedBody> = {
            let Some(method) = &self.cur().method else {
                return Err(Abort::Thrown);
            };
            Arc::clone(method.initialized().unwrap())
        };
        let offset = self.ip;
        let max = max_index.unwrap_or(body.try_blocks.len());

        for t in 0..max {
            let block = &body.try_blocks[t];
            if offset < block.try_start || offset > block.try_end {
                continue;
            }
            match &block.handler {
                TryHandler::Catch(catches) => {
                    for c in catches {
                        let caught = match c.caught_type {
                            CaughtType::Resolved(id) => id,
                            CaughtType::Token(_) => continue,
                        };
                        if self.vm.value_is_type(&self.current_error, caught) {
                            let eval_base = self.cur().eval_base;
                            self.stack[eval_base] = self.current_error.clone();
                            self.cur_mut().stack_count = 1;
                            self.ip = c.start;
                            return Ok(());
                        }
                    }
                }
                TryHandler::Finally { start, .. } => {
                    let start = *start;
                    self.cur_mut().stack_count = 0;
                    // Save the in-flight error where the root-set walker can
                    // see it: an error thrown and caught inside the finally
                    // overwrites the current error.
                    self.error_stack.push(self.current_error.clone());
                    self.ip = start;
                    loop {
                        match self.evaluate() {
                            Ok(()) => break,
                            Err(Abort::Thrown) => match self.find_error_handler(Some(t)) {
                                Ok(()) => continue,
                                Err(err) => {
                                    // The error from the finally replaces the
                                    // one being propagated.
                                    self.error_stack.pop();
                                    return Err(err);
                                }
                            },
                            Err(err) => {
                                self.error_stack.pop();
                                return Err(err);
                            }
                        }
                    }
                    self.ip = offset;
                    self.current_error = self.error_stack.pop().unwrap();
                }
            }
            // Keep scanning: an outer try block may still handle the error.
        }
        Err(Abort::Thrown)
    }

    /// Executes the finally clauses a `leave` passes through: every finally
    /// whose protected range contains the leave but not its target.
    fn evaluate_leave(&mut self, target: i32) -> Result<(), Abort> {
        const LEAVE_SIZE: u32 = (OPCODE_SIZE + oa::BRANCH_SIZE) as u32;

        let body: Arc<InitializedBody> = {
            let method = self.cur().method.as_ref().unwrap();
            Arc::clone(method.initialized().unwrap())
        };
        let ip_offset = self.ip + LEAVE_SIZE;
        let t_offset = (ip_offset as i64 + target as i64) as u32;

        for t in 0..body.try_blocks.len() {
            let block = &body.try_blocks[t];
            let (start, end) = match &block.handler {
                TryHandler::Finally { start, end } => (*start, *end),
                _ => continue,
            };
            if ip_offset >= block.try_start
                && ip_offset <= block.try_end
                && (t_offset < block.try_start || t_offset >= block.try_end)
                && (t_offset < start || t_offset >= end)
            {
                let prev_ip = self.ip;
                let saved_count = self.cur().stack_count;
                self.cur_mut().stack_count = 0;
                self.error_stack.push(self.current_error.clone());
                self.ip = start;
                loop {
                    match self.evaluate() {
                        Ok(()) => break,
                        Err(Abort::Thrown) => match self.find_error_handler(Some(t)) {
                            Ok(()) => continue,
                            Err(err) => {
                                self.error_stack.pop();
                                return Err(err);
                            }
                        },
                        Err(err) => {
                            self.error_stack.pop();
                            return Err(err);
                        }
                    }
                }
                self.ip = prev_ip;
                self.current_error = self.error_stack.pop().unwrap();
                self.cur_mut().stack_count = saved_count;
            }
        }
        Ok(())
    }

    /// Formats the current stack trace.
    pub fn stack_trace(&self) -> String {
        StackTraceFormatter::format(self)
    }

    // ------------------------------------------------------------------
    // Convenience entry points
    // ------------------------------------------------------------------

    /// Determines whether the two values on top of the stack are equal
    /// according to the `==` operator. Pops both.
    pub fn equals(&mut self) -> Result<bool, Abort> {
        let args_slot = self.cur().top_slot(1);
        let result = self.equals_ll(args_slot)?;
        self.cur_mut().stack_count -= 2;
        Ok(result)
    }

    /// Compares the two values on top of the stack with the `<=>` operator.
    /// Pops both.
    pub fn compare(&mut self) -> Result<i64, Abort> {
        let args_slot = self.cur().top_slot(1);
        let result = self.compare_ll(args_slot)?;
        self.cur_mut().stack_count -= 2;
        Ok(result)
    }

    /// Invokes the value below `argc` arguments on the stack, pushing the
    /// result.
    pub fn invoke(&mut self, argc: u32) -> Result<(), Abort> {
        let value_slot = self.cur().top_slot(argc);
        let result = self.invoke_ll(argc, value_slot, 0)?;
        self.cur_mut().stack_count -= argc + 1;
        self.push(result)
    }
}

/// Applies a signed relative branch offset to an instruction-end position.
fn offset_by(end: usize, rel: i32) -> usize {
    (end as i64 + rel as i64) as usize
}
