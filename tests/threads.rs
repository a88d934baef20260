//! Thread state, unmanaged regions, and GC cooperation.

mod common;

use std::sync::Arc;

use common::*;
use ovum::gc::heap::ObjectBody;
use ovum::prelude::*;
use ovum::runtime::member::Access;
use ovum::runtime::type_info::Operator;
use ovum::vm::thread::ThreadState;

fn single_module() -> (VmBuilder, ModuleId) {
    let mut builder = VmBuilder::new();
    let module = builder.begin_module("test");
    (builder, module)
}

#[test]
fn thread_state_machine() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.retnull();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 1));
    let vm = b.build();

    let overload = Arc::clone(&vm.method(method).overloads[0]);
    let mut thread = Thread::new(Arc::clone(&vm));
    assert_eq!(thread.state(), ThreadState::Created);
    let result = thread.start(&overload, vec![]);
    assert_eq!(result.unwrap(), Value::Null);
    assert_eq!(thread.state(), ThreadState::Stopped);

    // A stopped thread cannot be started again.
    assert!(thread.start(&overload, vec![]).is_err());
}

#[test]
fn unmanaged_regions_are_flat() {
    let (b, _) = single_module();
    let vm = b.build();
    let mut thread = Thread::new(Arc::clone(&vm));

    assert!(thread.enter_unmanaged_region());
    // Nested entries collapse silently.
    assert!(!thread.enter_unmanaged_region());
    assert!(thread.leave_unmanaged_region());
    assert!(!thread.leave_unmanaged_region());
}

#[test]
fn collection_frees_unreachable_objects() {
    let (b, _) = single_module();
    let vm = b.build();
    let mut thread = Thread::new(Arc::clone(&vm));

    let kept = vm.gc().alloc_fields(vm.standard.object, 1).unwrap();
    let dropped = vm.gc().alloc_fields(vm.standard.object, 0).unwrap();
    vm.gc().write_field(
        kept,
        0,
        Value::Object {
            type_id: vm.standard.object,
            handle: dropped,
        },
    );

    // Only `kept` is rooted (through the eval stack); `dropped` survives
    // because `kept` references it.
    thread
        .push(Value::Object {
            type_id: vm.standard.object,
            handle: kept,
        })
        .unwrap();
    assert_eq!(vm.gc().collect(&thread), 0);
    assert_eq!(vm.gc().live_count(), 2);

    // Popping the root makes both unreachable.
    thread.pop();
    assert_eq!(vm.gc().collect(&thread), 2);
    assert_eq!(vm.gc().live_count(), 0);
}

#[test]
fn static_fields_are_roots() {
    let (mut b, module) = single_module();
    b.add_static_field(None, "pinned", Access::Public);
    let vm = b.build();
    let thread = Thread::new(Arc::clone(&vm));

    let pinned = vm.gc().alloc_fields(vm.standard.object, 0).unwrap();
    vm.module(module).statics.values[0].write(Value::Object {
        type_id: vm.standard.object,
        handle: pinned,
    });

    assert_eq!(vm.gc().collect(&thread), 0);
    assert_eq!(vm.gc().live_count(), 1);

    vm.module(module).statics.values[0].write(Value::Null);
    assert_eq!(vm.gc().collect(&thread), 1);
}

#[test]
fn current_error_is_a_root() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(7).throw();
    let (method, _) = add_global_fn(&mut b, "test.boom", vec![], body(a, 0, 1));
    let vm = b.build();

    let (thread, result) = run_method(&vm, method, vec![]);
    assert!(result.is_err());
    // The error object hangs off the thread's current-error slot only; a
    // cycle must not free it.
    assert!(vm.gc().live_count() > 0);
    vm.gc().collect(&thread);
    assert!(vm.value_is_type(thread.current_error(), vm.standard.error));
    match thread.current_error() {
        Value::Object { handle, .. } => {
            assert!(vm.gc().read_field(*handle, 0).is_some());
        }
        other => panic!("unexpected error value {other:?}"),
    }
}

#[test]
fn interned_strings_share_storage() {
    let (b, _) = single_module();
    let vm = b.build();
    let a = vm.gc().intern("hello");
    let b2 = vm.gc().intern("hello");
    assert!(Arc::ptr_eq(&a, &b2));
    assert!(vm.gc().has_interned("hello"));
}

#[test]
fn gc_cycle_suspends_a_running_thread() {
    // A second managed thread runs a long countdown; the main thread starts
    // a GC cycle, which must wait for the worker to reach a safepoint (or
    // stop) rather than deadlock.
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(50_000).stloc(0);
    let top = a.here();
    a.ldloc(0).ldc_i(1).operator(Operator::Sub).stloc(0);
    a.ldloc(0);
    a.brtrue_to(top);
    a.retnull();
    let (method, _) = add_global_fn(&mut b, "test.spin", vec![], body(a, 1, 2));
    let vm = b.build();

    let overload = Arc::clone(&vm.method(method).overloads[0]);
    let worker_vm = Arc::clone(&vm);
    let worker = std::thread::spawn(move || {
        let mut thread = Thread::new(worker_vm);
        thread.start(&overload, vec![]).unwrap();
    });

    let main = Thread::new(Arc::clone(&vm));
    vm.gc().collect(&main);
    assert_eq!(vm.gc().cycle_count(), 1);

    worker.join().unwrap();
    vm.gc().collect(&main);
    assert_eq!(vm.gc().cycle_count(), 2);
}

#[test]
fn list_bodies_are_traced() {
    let (b, _) = single_module();
    let vm = b.build();
    let mut thread = Thread::new(Arc::clone(&vm));

    let element = vm.gc().alloc_fields(vm.standard.object, 0).unwrap();
    let list = vm
        .gc()
        .alloc_body(
            vm.standard.list,
            ObjectBody::List(vec![Value::Object {
                type_id: vm.standard.object,
                handle: element,
            }]),
        )
        .unwrap();

    thread
        .push(Value::Object {
            type_id: vm.standard.list,
            handle: list,
        })
        .unwrap();
    assert_eq!(vm.gc().collect(&thread), 0);
    assert_eq!(vm.gc().live_count(), 2);
}
