//! End-to-end execution tests: arithmetic, control flow, exception
//! handling, references, member dispatch and invocation.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::*;
use ovum::prelude::*;
use ovum::runtime::member::{Access, Param};
use ovum::runtime::method::{
    CatchBlock, CaughtType, DebugSymbol, DebugSymbols, MethodFlags, TryBlock, TryHandler,
};
use ovum::runtime::builder::OverloadDef;
use ovum::runtime::standard::error_fields;
use ovum::runtime::type_info::{Operator, TypeFlags};

fn single_module() -> (VmBuilder, ModuleId) {
    let mut builder = VmBuilder::new();
    let module = builder.begin_module("test");
    (builder, module)
}

fn error_field(vm: &Arc<Vm>, error: &Value, index: u32) -> Value {
    match error {
        Value::Object { handle, .. } => vm.gc().read_field(*handle, index).unwrap(),
        other => panic!("not an error object: {other:?}"),
    }
}

#[test]
fn adds_two_int_constants() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(5).ldc_i(7).operator(Operator::Add).ret();
    let (method, _) = add_global_fn(&mut b, "test.add", vec![], body(a, 0, 2));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(12));
}

#[test]
fn diamond_control_flow_merges() {
    // ldarg.0; brfalse L; ldc.i 1; br E; L: ldc.i 2; E: ret
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldarg(0);
    let to_else = a.brfalse();
    a.ldc_i(1);
    let to_end = a.br();
    a.bind(to_else);
    a.ldc_i(2);
    a.bind(to_end);
    a.ret();
    let (method, _) = add_global_fn(&mut b, "test.pick", vec![Param::new("x")], body(a, 0, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![Value::Null]);
    assert_eq!(result.unwrap(), Value::Int(2));
    let (_, result) = run_method(&vm, method, vec![Value::Bool(false)]);
    assert_eq!(result.unwrap(), Value::Int(2));
    let (_, result) = run_method(&vm, method, vec![Value::Int(1)]);
    assert_eq!(result.unwrap(), Value::Int(1));
}

#[test]
fn divide_by_zero_is_caught() {
    // try { ldarg.0; ldc.i 0; div; ret } catch DivideByZeroError { -1 }
    let (mut b, _) = single_module();
    let dbz = b.standard().divide_by_zero_error;
    let dbz_token = b.import_type(dbz);

    let mut a = Asm::new();
    let try_start = a.here();
    a.ldarg(0).ldc_i(0).operator(Operator::Div).ret();
    let catch_start = a.here();
    a.pop().ldc_i(-1).ret();
    let catch_end = a.here();

    let try_blocks = vec![TryBlock {
        try_start,
        try_end: catch_start,
        handler: TryHandler::Catch(vec![CatchBlock {
            caught_type: CaughtType::Token(dbz_token),
            start: catch_start,
            end: catch_end,
        }]),
    }];
    let (method, _) = add_global_fn(
        &mut b,
        "test.divide",
        vec![Param::new("x")],
        body_with(a, 0, 2, try_blocks, None),
    );
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![Value::Int(10)]);
    assert_eq!(result.unwrap(), Value::Int(-1));
    // Division checks for zero first, so 0/0 throws the same error.
    let (_, result) = run_method(&vm, method, vec![Value::Int(0)]);
    assert_eq!(result.unwrap(), Value::Int(-1));

    // The catch start resolves to the instruction following the return of
    // the protected body.
    let built = build_method(&vm, method).unwrap();
    let decoded = decode(&built.code);
    match &built.try_blocks[0].handler {
        TryHandler::Catch(catches) => {
            assert_eq!(catches[0].start as usize, decoded[4].offset);
        }
        _ => unreachable!(),
    }
}

#[test]
fn uncaught_error_propagates_with_type() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(1).ldc_i(0).operator(Operator::Div).ret();
    let (method, _) = add_global_fn(&mut b, "test.boom", vec![], body(a, 0, 2));
    let vm = b.build();

    let (thread, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap_err(), Abort::Thrown);
    assert!(vm.value_is_type(thread.current_error(), vm.standard.divide_by_zero_error));
}

#[test]
fn field_reference_argument_writes_through() {
    let (mut b, _) = single_module();
    let object = b.standard().object;
    let (class, class_token) = b.add_type("test.C", Access::Public, TypeFlags::empty(), Some(object));
    let (_, field_token) = b.add_instance_field(class, "f", Access::Public);
    let (ctor, _) = b.add_method(
        Some(class),
        "new",
        Access::Public,
        MethodFlags::CTOR,
        false,
        vec![OverloadDef::native(true, vec![], |_, _, _| Ok(Value::Null))],
    );
    b.set_instance_ctor(class, ctor);

    let mut helper = Asm::new();
    helper.ldc_i(42).starg(0).retnull();
    let (_, helper_token) = add_global_fn(
        &mut b,
        "test.assign42",
        vec![Param::by_ref("x")],
        body(helper, 0, 1),
    );

    let mut a = Asm::new();
    a.newobj(class_token, 0).stloc(0);
    a.ldloc(0).ldfldref(field_token);
    a.scall(helper_token, 1).pop();
    a.ldloc(0).ldfld(field_token).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 1, 2));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(42));
}

#[test]
fn local_reference_argument_writes_through() {
    let (mut b, _) = single_module();
    let mut helper = Asm::new();
    helper.ldc_i(9).starg(0).retnull();
    let (_, helper_token) = add_global_fn(
        &mut b,
        "test.assign9",
        vec![Param::by_ref("x")],
        body(helper, 0, 1),
    );

    let mut a = Asm::new();
    a.ldc_i(0).stloc(0);
    a.ldlocref(0);
    a.scall(helper_token, 1).pop();
    a.ldloc(0).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 1, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(9));
}

#[test]
fn leave_runs_nested_finallys_innermost_first() {
    let (mut b, _) = single_module();
    let (_, add_token) = b.add_string("add");

    let mut a = Asm::new();
    a.list(0).stloc(0);
    let t_start = a.here();
    let leave_fix = a.leave();
    let t1_end = a.here();

    let f1_start = a.here();
    a.ldloc(0).ldc_i(1).callmem(add_token, 1).pop().endfinally();
    let f1_end = a.here();

    let f2_start = a.here();
    a.ldloc(0).ldc_i(2).callmem(add_token, 1).pop().endfinally();
    let f2_end = a.here();

    let f3_start = a.here();
    a.ldloc(0).ldc_i(3).callmem(add_token, 1).pop().endfinally();
    let f3_end = a.here();

    a.bind(leave_fix);
    a.ldloc(0).ret();

    let try_blocks = vec![
        TryBlock {
            try_start: t_start,
            try_end: t1_end,
            handler: TryHandler::Finally {
                start: f1_start,
                end: f1_end,
            },
        },
        TryBlock {
            try_start: t_start,
            try_end: f1_end,
            handler: TryHandler::Finally {
                start: f2_start,
                end: f2_end,
            },
        },
        TryBlock {
            try_start: t_start,
            try_end: f2_end,
            handler: TryHandler::Finally {
                start: f3_start,
                end: f3_end,
            },
        },
    ];
    let (method, _) = add_global_fn(
        &mut b,
        "test.main",
        vec![],
        body_with(a, 1, 2, try_blocks, None),
    );
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    let list = result.unwrap();
    let Value::Object { handle, .. } = list else {
        panic!("expected a List, got {list:?}");
    };
    let elements = vm
        .gc()
        .with_body(handle, |body| match body {
            ovum::gc::heap::ObjectBody::List(values) => values.clone(),
            _ => vec![],
        })
        .unwrap();
    assert_eq!(
        elements,
        vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        "finally clauses must run innermost first"
    );
}

#[test]
fn error_in_finally_reaches_outer_catch() {
    let (mut b, _) = single_module();
    let error = b.standard().error;
    let error_token = b.import_type(error);

    let mut a = Asm::new();
    let outer_start = a.here();
    let leave_fix = a.leave();
    let inner_end = a.here();
    let fin_start = a.here();
    a.ldc_i(5).throw();
    let fin_end = a.here();
    let catch_start = a.here();
    a.pop().ldc_i(-1).ret();
    let catch_end = a.here();
    a.bind(leave_fix);
    a.ldc_i(0).ret();

    let try_blocks = vec![
        TryBlock {
            try_start: outer_start,
            try_end: inner_end,
            handler: TryHandler::Finally {
                start: fin_start,
                end: fin_end,
            },
        },
        TryBlock {
            try_start: outer_start,
            try_end: fin_end,
            handler: TryHandler::Catch(vec![CatchBlock {
                caught_type: CaughtType::Token(error_token),
                start: catch_start,
                end: catch_end,
            }]),
        },
    ];
    let (method, _) = add_global_fn(
        &mut b,
        "test.main",
        vec![],
        body_with(a, 0, 1, try_blocks, None),
    );
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(-1));
}

#[test]
fn thrown_error_carries_stack_trace_with_source_line() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(11).throw();
    let code_len = a.here();
    let debug = DebugSymbols {
        file: Arc::from("test.osp"),
        symbols: vec![DebugSymbol {
            start: 0,
            end: code_len,
            line: 7,
        }],
    };
    let (method, _) = add_global_fn(
        &mut b,
        "test.main",
        vec![],
        body_with(a, 0, 1, Vec::new(), Some(debug)),
    );
    let vm = b.build();

    let (thread, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap_err(), Abort::Thrown);

    let error = thread.current_error().clone();
    // The thrown Int is wrapped in an Error with the value as data.
    assert!(vm.value_is_type(&error, vm.standard.error));
    assert_eq!(error_field(&vm, &error, error_fields::DATA), Value::Int(11));
    let Value::Str(trace) = error_field(&vm, &error, error_fields::STACK_TRACE) else {
        panic!("no stack trace recorded");
    };
    assert!(trace.contains("test.main"), "{trace}");
    assert!(trace.contains("at line 7 in \"test.osp\""), "{trace}");
}

#[test]
fn switch_dispatches_and_falls_through() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldarg(0);
    let fixups = a.switch(2);
    a.ldc_i(-1).ret(); // fall-through
    a.bind(fixups[0]);
    a.ldc_i(100).ret();
    a.bind(fixups[1]);
    a.ldc_i(200).ret();
    let (method, _) = add_global_fn(&mut b, "test.pick", vec![Param::new("x")], body(a, 0, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![Value::Int(0)]);
    assert_eq!(result.unwrap(), Value::Int(100));
    let (_, result) = run_method(&vm, method, vec![Value::Int(1)]);
    assert_eq!(result.unwrap(), Value::Int(200));
    let (_, result) = run_method(&vm, method, vec![Value::Int(2)]);
    assert_eq!(result.unwrap(), Value::Int(-1));
    let (_, result) = run_method(&vm, method, vec![Value::Int(-3)]);
    assert_eq!(result.unwrap(), Value::Int(-1));
}

#[test]
fn switch_with_count_zero_only_pops_the_selector() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(4);
    let fixups = a.switch(0);
    assert!(fixups.is_empty());
    a.ldc_i(8).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(8));
}

#[test]
fn bound_method_apply_spreads_list() {
    let (mut b, _) = single_module();
    let (_, add_token) = b.add_string("add");

    let mut add2 = Asm::new();
    add2.ldarg(0).ldarg(1).operator(Operator::Add).ret();
    let (_, add2_token) = add_global_fn(
        &mut b,
        "test.add2",
        vec![Param::new("a"), Param::new("b")],
        body(add2, 0, 2),
    );

    let mut a = Asm::new();
    a.ldsfn(add2_token);
    a.list(0);
    a.dup().ldc_i(3).callmem(add_token, 1).pop();
    a.dup().ldc_i(4).callmem(add_token, 1).pop();
    a.apply().ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 4));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(7));
}

#[test]
fn sapply_resolves_overload_from_list_length() {
    let (mut b, _) = single_module();
    let (_, add_token) = b.add_string("add");

    let mut add2 = Asm::new();
    add2.ldarg(0).ldarg(1).operator(Operator::Mul).ret();
    let (_, mul2_token) = add_global_fn(
        &mut b,
        "test.mul2",
        vec![Param::new("a"), Param::new("b")],
        body(add2, 0, 2),
    );

    let mut a = Asm::new();
    a.list(0);
    a.dup().ldc_i(6).callmem(add_token, 1).pop();
    a.dup().ldc_i(7).callmem(add_token, 1).pop();
    a.sapply(mul2_token).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 3));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(42));
}

#[test]
fn member_and_indexer_access_on_list() {
    let (mut b, _) = single_module();
    let (_, add_token) = b.add_string("add");
    let (_, length_token) = b.add_string("length");

    // list; add 10; add 20; list[1] = list[0] + list[1]; return list.length
    let mut a = Asm::new();
    a.list(0).stloc(0);
    a.ldloc(0).ldc_i(10).callmem(add_token, 1).pop();
    a.ldloc(0).ldc_i(20).callmem(add_token, 1).pop();
    a.ldloc(0).ldc_i(0).ldidx(1); // list[0]
    a.stloc(1);
    a.ldloc(0).ldc_i(1); // target for stidx
    a.ldloc(1);
    a.ldloc(0).ldc_i(1).ldidx(1); // list[1]
    a.operator(Operator::Add);
    a.stidx(1);
    a.ldloc(0).ldmem(length_token).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 2, 5));
    let vm = b.build();

    let (thread, result) = run_method(&vm, method, vec![]);
    drop(thread);
    assert_eq!(result.unwrap(), Value::Int(2));
}

#[test]
fn stmem_writes_fields_and_properties() {
    let (mut b, _) = single_module();
    let object = b.standard().object;
    let (class, class_token) = b.add_type("test.Box", Access::Public, TypeFlags::empty(), Some(object));
    b.add_instance_field(class, "value", Access::Public);
    let (ctor, _) = b.add_method(
        Some(class),
        "new",
        Access::Public,
        MethodFlags::CTOR,
        false,
        vec![OverloadDef::native(true, vec![], |_, _, _| Ok(Value::Null))],
    );
    b.set_instance_ctor(class, ctor);
    let (_, value_token) = b.add_string("value");

    let mut a = Asm::new();
    a.newobj(class_token, 0).stloc(0);
    a.ldloc(0).ldc_i(55).stmem(value_token);
    a.ldloc(0).ldmem(value_token).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 1, 2));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(55));
}

#[test]
fn ldtype_pushes_a_type_token_object() {
    let (mut b, _) = single_module();
    let (_, name_token) = b.add_string("name");
    let mut a = Asm::new();
    a.ldc_i(5).ldtype().ldmem(name_token).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Str(Arc::from("aves.Int")));
}

#[test]
fn variadic_overload_packs_surplus_arguments() {
    let (mut b, _) = single_module();
    let (_, length_token) = b.add_string("length");
    let mut helper = Asm::new();
    helper.ldarg(0).ldmem(length_token).ret();
    let (helper_id, helper_token) = add_global_fn(
        &mut b,
        "test.count",
        vec![Param::variadic("rest")],
        body(helper, 0, 1),
    );

    let mut a = Asm::new();
    a.ldc_i(1).ldc_i(2).ldc_i(3).scall(helper_token, 3).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 3));
    let vm = b.build();
    let _ = helper_id;

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(3));
}

#[test]
fn reference_identity_branches() {
    let (mut b, _) = single_module();
    let (_, s_token) = b.add_string("shared");
    let mut a = Asm::new();
    a.ldstr(s_token).ldstr(s_token);
    let same = a.brref();
    a.ldc_i(0).ret();
    a.bind(same);
    a.ldc_i(1).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 2));
    let vm = b.build();

    // Interned strings share storage, so they are the same reference.
    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(1));
}

#[test]
fn concat_builds_strings() {
    let (mut b, _) = single_module();
    let (_, s_token) = b.add_string("x = ");
    let mut a = Asm::new();
    a.ldstr(s_token).ldc_i(9).concat().ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 2));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Str(Arc::from("x = 9")));
}

#[test]
fn enum_values_compare_by_payload() {
    let (mut b, _) = single_module();
    let object = b.standard().object;
    let (color, color_token) = b.add_type(
        "test.Color",
        Access::Public,
        TypeFlags::PRIMITIVE | TypeFlags::SEALED,
        Some(object),
    );
    let _ = color;
    let mut a = Asm::new();
    // ldenum Color 2 == ldenum Color 2 via reference identity
    a.ldenum(color_token, 2);
    a.ldenum(color_token, 2);
    let same = a.brref();
    a.ldc_i(0).ret();
    a.bind(same);
    a.ldc_i(1).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 2));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(1));
}

#[test]
fn method_initialization_happens_once() {
    let (mut b, _) = single_module();
    let mut inner = Asm::new();
    inner.ldc_i(21).ldc_i(2).operator(Operator::Mul).ret();
    let (inner_id, inner_token) = add_global_fn(&mut b, "test.inner", vec![], body(inner, 0, 2));

    let mut a = Asm::new();
    a.scall(inner_token, 0).pop();
    a.scall(inner_token, 0).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(42));

    // The overload was initialized exactly once and keeps its body.
    let overload = &vm.method(inner_id).overloads[0];
    assert!(overload.is_initialized());
    let body_ptr = Arc::as_ptr(overload.initialized().unwrap());
    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(42));
    assert_eq!(body_ptr, Arc::as_ptr(overload.initialized().unwrap()));
}

#[test]
fn static_fields_persist_across_calls() {
    let (mut b, _) = single_module();
    let (_, cell_token) = b.add_static_field(None, "cell", Access::Public);

    let mut bump = Asm::new();
    bump.ldsfld(cell_token);
    let not_null = bump.brinst();
    bump.ldc_i(0).stsfld(cell_token);
    bump.bind(not_null);
    bump.ldsfld(cell_token).ldc_i(1).operator(Operator::Add).stsfld(cell_token);
    bump.ldsfld(cell_token).ret();
    let (bump_id, bump_token) = add_global_fn(&mut b, "test.bump", vec![], body(bump, 0, 2));

    let mut a = Asm::new();
    a.scall(bump_token, 0).pop();
    a.scall(bump_token, 0).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 1));
    let vm = b.build();
    let _ = bump_id;

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(2));
}

#[test]
fn static_constructor_runs_before_first_use() {
    let (mut b, _) = single_module();
    let object = b.standard().object;
    let (holder, _) = b.add_type("test.Holder", Access::Public, TypeFlags::empty(), Some(object));
    let (_, seed_token) = b.add_static_field(Some(holder), "seed", Access::Public);

    let mut cctor = Asm::new();
    cctor.ldc_i(99).stsfld(seed_token).retnull();
    let (cctor_id, _) = b.add_method(
        Some(holder),
        ".init",
        Access::Private,
        MethodFlags::STATIC | MethodFlags::CTOR,
        false,
        vec![OverloadDef::bytecode(
            false,
            vec![],
            body(cctor, 0, 1),
        )],
    );
    b.set_static_ctor(holder, cctor_id);

    let mut a = Asm::new();
    a.ldsfld(seed_token).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 0, 1));
    let vm = b.build();

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(99));
}
