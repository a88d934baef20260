//! The collector front end and the safepoint protocol.
//!
//! Managed threads and the GC cooperate through a small shared state block
//! per thread ([`ThreadShared`]):
//!
//! - the GC posts a [`ThreadRequest::SuspendForGc`] request and enters the
//!   thread's cycle lock;
//! - the thread observes the request at its next safepoint, publishes the
//!   `SuspendedByGc` state, and blocks on the cycle lock until the GC
//!   releases it;
//! - a thread inside an unmanaged region counts as suspended without
//!   blocking, and re-checks the request when it leaves the region.
//!
//! The heap lock below serializes every object access, including the
//! reference-mediated reads and writes the interpreter performs through
//! field references.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ovum_core::{ObjHandle, TypeId, Value, VmError};

use crate::gc::heap::{ObjectBody, ObjectHeap};
use crate::gc::roots::{RootSetVisitor, RootSetWalker};
use crate::gc::string_table::StringTable;
use crate::runtime::module::StaticRefBlock;
use crate::vm::thread::{Thread, ThreadState};

/// A request posted to a thread by another thread. Only one request can be
/// active at a time; today only the GC posts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadRequest {
    None = 0,
    /// Suspend for the GC at the next safepoint.
    SuspendForGc = 1,
}

/// The per-thread state block shared between a managed thread and the GC.
#[derive(Debug)]
pub struct ThreadShared {
    pending: AtomicU8,
    state: AtomicU8,
    in_unmanaged: AtomicBool,
    cycle_lock: Mutex<()>,
}

impl Default for ThreadShared {
    fn default() -> ThreadShared {
        ThreadShared {
            pending: AtomicU8::new(ThreadRequest::None as u8),
            state: AtomicU8::new(ThreadState::Created as u8),
            in_unmanaged: AtomicBool::new(false),
            cycle_lock: Mutex::new(()),
        }
    }
}

impl ThreadShared {
    pub fn new() -> ThreadShared {
        ThreadShared::default()
    }

    pub fn pending_request(&self) -> ThreadRequest {
        match self.pending.load(Ordering::Acquire) {
            0 => ThreadRequest::None,
            _ => ThreadRequest::SuspendForGc,
        }
    }

    pub fn post_request(&self, request: ThreadRequest) {
        self.pending.store(request as u8, Ordering::Release);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_in_unmanaged_region(&self) -> bool {
        self.in_unmanaged.load(Ordering::Acquire)
    }

    /// Marks the thread as inside an unmanaged region. Returns false when it
    /// already was — unmanaged regions are flat, and nested entries collapse.
    pub fn enter_unmanaged(&self) -> bool {
        !self.in_unmanaged.swap(true, Ordering::AcqRel)
    }

    /// Clears the unmanaged-region flag. Returns false when it was not set.
    pub fn leave_unmanaged(&self) -> bool {
        self.in_unmanaged.swap(false, Ordering::AcqRel)
    }

    /// Whether the GC may treat this thread as parked: it has published the
    /// suspended state, is in an unmanaged region, or is not running managed
    /// code at all.
    pub fn is_suspended_for_gc(&self) -> bool {
        self.is_in_unmanaged_region()
            || matches!(
                self.state(),
                ThreadState::SuspendedByGc | ThreadState::Created | ThreadState::Stopped
            )
    }

    /// Blocks on the cycle lock until the GC releases it. Called by the
    /// owning thread from a safepoint, and when leaving an unmanaged region
    /// during a cycle.
    pub fn wait_for_cycle(&self) {
        drop(self.cycle_lock.lock().unwrap());
    }
}

/// The collector front end: allocation, interning, and cycle coordination.
#[derive(Debug)]
pub struct Gc {
    heap: Mutex<ObjectHeap>,
    strings: Mutex<StringTable>,
    threads: Mutex<Vec<Arc<ThreadShared>>>,
    cycle_count: AtomicUsize,
    /// Optional live-object budget; allocation beyond it reports
    /// out-of-memory. Used to exercise the memory-error paths.
    capacity: Option<usize>,
}

impl Default for Gc {
    fn default() -> Gc {
        Gc::new(None)
    }
}

impl Gc {
    pub fn new(capacity: Option<usize>) -> Gc {
        Gc {
            heap: Mutex::new(ObjectHeap::new()),
            strings: Mutex::new(StringTable::new()),
            threads: Mutex::new(Vec::new()),
            cycle_count: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Registers a managed thread's shared state block for the cycle
    /// protocol.
    pub fn register_thread(&self, shared: Arc<ThreadShared>) {
        self.threads.lock().unwrap().push(shared);
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_count.load(Ordering::Relaxed)
    }

    pub fn live_count(&self) -> usize {
        self.heap.lock().unwrap().live_count()
    }

    // ------------------------------------------------------------------
    // Allocation and object access
    // ------------------------------------------------------------------

    pub fn alloc_fields(&self, type_id: TypeId, field_count: u32) -> Result<ObjHandle, VmError> {
        let mut heap = self.heap.lock().unwrap();
        if let Some(cap) = self.capacity {
            if heap.live_count() >= cap {
                return Err(VmError::OutOfMemory);
            }
        }
        Ok(heap.alloc_fields(type_id, field_count))
    }

    pub fn alloc_body(&self, type_id: TypeId, body: ObjectBody) -> Result<ObjHandle, VmError> {
        let mut heap = self.heap.lock().unwrap();
        if let Some(cap) = self.capacity {
            if heap.live_count() >= cap {
                return Err(VmError::OutOfMemory);
            }
        }
        Ok(heap.alloc(type_id, body))
    }

    pub fn type_of(&self, handle: ObjHandle) -> Option<TypeId> {
        self.heap.lock().unwrap().type_of(handle)
    }

    /// Reads an instance field. Taking the heap lock here is what makes
    /// reference-mediated field access atomic with respect to other threads.
    pub fn read_field(&self, handle: ObjHandle, index: u32) -> Option<Value> {
        self.heap.lock().unwrap().field(handle, index)
    }

    pub fn write_field(&self, handle: ObjHandle, index: u32, value: Value) -> bool {
        self.heap.lock().unwrap().set_field(handle, index, value)
    }

    /// Runs `f` with the object's body under the heap lock.
    pub fn with_body<R>(&self, handle: ObjHandle, f: impl FnOnce(&ObjectBody) -> R) -> Option<R> {
        let heap = self.heap.lock().unwrap();
        heap.body(handle).map(f)
    }

    pub fn with_body_mut<R>(
        &self,
        handle: ObjHandle,
        f: impl FnOnce(&mut ObjectBody) -> R,
    ) -> Option<R> {
        let mut heap = self.heap.lock().unwrap();
        heap.body_mut(handle).map(f)
    }

    /// Interns a string in the GC's string table.
    pub fn intern(&self, value: &str) -> Arc<str> {
        self.strings.lock().unwrap().intern(value)
    }

    pub fn has_interned(&self, value: &str) -> bool {
        self.strings.lock().unwrap().has_interned(value)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Runs a full mark-sweep cycle from `thread`, which must be the
    /// currently executing managed thread. Every other registered thread is
    /// held at a safepoint for the duration. Returns the number of objects
    /// freed.
    ///
    /// The walk covers the requesting thread's frames, the static reference
    /// blocks and module strings; walking the frames of the other, suspended
    /// threads belongs to the full collector, which is outside the execution
    /// core.
    pub fn collect(&self, thread: &Thread) -> usize {
        let shareds: Vec<Arc<ThreadShared>> = {
            let threads = self.threads.lock().unwrap();
            threads
                .iter()
                .filter(|s| !Arc::ptr_eq(s, thread.shared()))
                .cloned()
                .collect()
        };

        // Enter every cycle lock first, then post the requests; suspending
        // threads block on the lock until the cycle ends.
        let guards: Vec<_> = shareds
            .iter()
            .map(|s| s.cycle_lock.lock().unwrap())
            .collect();
        for shared in &shareds {
            shared.post_request(ThreadRequest::SuspendForGc);
        }
        for shared in &shareds {
            while !shared.is_suspended_for_gc() {
                std::thread::yield_now();
            }
        }

        tracing::debug!(threads = shareds.len(), "gc cycle start");

        let freed = {
            let mut heap = self.heap.lock().unwrap();
            heap.clear_marks();

            let mut pending: Vec<ObjHandle> = Vec::new();
            let mut visitor = MarkVisitor {
                pending: &mut pending,
            };
            RootSetWalker::new(thread.vm()).walk(thread, &mut visitor);

            while let Some(handle) = pending.pop() {
                if heap.mark(handle) {
                    heap.trace(handle, &mut pending);
                }
            }
            heap.sweep()
        };

        for shared in &shareds {
            shared.post_request(ThreadRequest::None);
        }
        drop(guards);

        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(freed, "gc cycle end");
        freed
    }
}

/// Root-set visitor that queues object handles for marking.
struct MarkVisitor<'a> {
    pending: &'a mut Vec<ObjHandle>,
}

impl RootSetVisitor for MarkVisitor<'_> {
    fn visit_root_value(&mut self, value: &Value) {
        match value {
            Value::Object { handle, .. } => self.pending.push(*handle),
            Value::FieldRef { object, .. } => self.pending.push(*object),
            _ => {}
        }
    }

    fn visit_root_local_value(&mut self, value: &Value) {
        // Local values can be references; the referent storage is itself
        // part of the root set (a frame slot or a static cell), so only the
        // field-reference owner needs marking here.
        self.visit_root_value(value);
    }

    fn visit_root_string(&mut self, _value: &Arc<str>) {
        // Strings are reference-counted rather than heap objects; nothing to
        // mark.
    }

    fn enter_static_ref_block(&mut self, _block: &StaticRefBlock) -> bool {
        true
    }

    fn leave_static_ref_block(&mut self, _block: &StaticRefBlock) {}
}
