//! Method-initialization tests: verification, folding, offset rewriting and
//! emission invariants.

mod common;

use pretty_assertions::assert_eq;

use common::*;
use ovum::bytecode::internal::{INSTR_ALIGNMENT, InternalOp};
use ovum::prelude::*;
use ovum::runtime::member::Param;
use ovum::runtime::method::{CatchBlock, CaughtType, TryBlock, TryHandler};
use ovum::runtime::type_info::Operator;

fn single_module() -> (VmBuilder, ModuleId) {
    let mut builder = VmBuilder::new();
    let module = builder.begin_module("test");
    (builder, module)
}

#[test]
fn straight_line_method_emits_constants_and_operator() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(5).ldc_i(7).operator(Operator::Add).ret();
    let (method, _) = add_global_fn(&mut b, "test.add", vec![], body(a, 0, 2));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    assert_eq!(
        opcodes(&built.code),
        vec![
            InternalOp::LdcIS,
            InternalOp::LdcIS,
            InternalOp::OperatorS,
            InternalOp::Ret,
        ]
    );

    // Every record starts aligned and offsets are strictly monotonic.
    let decoded = decode(&built.code);
    for pair in decoded.windows(2) {
        assert!(pair[0].offset < pair[1].offset);
    }
    for instr in &decoded {
        assert_eq!(instr.offset % INSTR_ALIGNMENT, 0);
    }
}

#[test]
fn initialization_is_deterministic() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(1).ldc_i(2).operator(Operator::Add).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 2));
    let vm = b.build();

    let first = build_method(&vm, method).unwrap();
    let second = build_method(&vm, method).unwrap();
    assert_eq!(&*first.code, &*second.code);
    assert_eq!(first.try_blocks, second.try_blocks);
}

#[test]
fn store_local_folds_into_producer() {
    // ldc.i 1; stloc.0; ldloc.0; ret
    // The store folds into the constant load (which becomes the L variant)
    // and the load survives as a local-to-stack move.
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(1).stloc(0).ldloc(0).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 1, 1));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    assert_eq!(
        opcodes(&built.code),
        vec![InternalOp::LdcIL, InternalOp::MvlocLS, InternalOp::Ret]
    );
}

#[test]
fn load_local_folds_into_consumer() {
    // Storing a local into a static field reads straight from the local.
    let (mut b, _) = single_module();
    let (_, field_token) = b.add_static_field(None, "cell", ovum::runtime::member::Access::Public);
    let mut a = Asm::new();
    a.ldc_i(9).stloc(0).ldloc(0).stsfld(field_token).retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 1, 1));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    assert_eq!(
        opcodes(&built.code),
        vec![InternalOp::LdcIL, InternalOp::StSFldL, InternalOp::RetNull]
    );
}

#[test]
fn comparison_fuses_with_branch() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldarg(0).ldc_i(0).eq();
    let to_zero = a.brtrue();
    a.ldc_i(1).ret();
    a.bind(to_zero);
    a.ldc_i(2).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![Param::new("x")], body(a, 0, 2));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    let ops = opcodes(&built.code);
    assert!(ops.contains(&InternalOp::BrEq), "expected a fused BrEq: {ops:?}");
    assert!(!ops.contains(&InternalOp::EqS));
    assert!(!ops.contains(&InternalOp::BrTrueS));

    // The fused branch still behaves like the original pair.
    let (_, result) = run_method(&vm, method, vec![Value::Int(0)]);
    assert_eq!(result.unwrap(), Value::Int(2));
    let (_, result) = run_method(&vm, method, vec![Value::Int(5)]);
    assert_eq!(result.unwrap(), Value::Int(1));
}

#[test]
fn dup_with_store_delivers_to_stack_and_local() {
    // dup; stloc.0 collapses into a single move that keeps the value on the
    // stack and copies it into the local.
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(3).dup().stloc(0).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 1, 2));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    assert_eq!(
        opcodes(&built.code),
        vec![InternalOp::LdcIS, InternalOp::MvlocLL, InternalOp::Ret]
    );
    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(3));
}

#[test]
fn branch_targets_land_on_instruction_starts() {
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
    let (method, _) = add_global_fn(&mut b, "test.f", vec![Param::new("x")], body(a, 0, 1));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    let decoded = decode(&built.code);
    let starts: Vec<usize> = decoded.iter().map(|d| d.offset).collect();
    for instr in &decoded {
        for target in &instr.targets {
            assert!(
                starts.contains(target),
                "branch target {target} is not an instruction start ({starts:?})"
            );
        }
    }
}

#[test]
fn conditional_branch_with_zero_offset_is_legal() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldtrue();
    let fix = a.brfalse();
    a.bind(fix); // target == fall-through
    a.retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Null);
    drop(built);
}

#[test]
fn try_end_at_method_end_maps_to_instruction_count() {
    let (mut b, _) = single_module();
    let error_token = {
        let error = b.standard().error;
        b.import_type(error)
    };
    let mut a = Asm::new();
    let try_start = a.here();
    a.ldc_i(1).ret();
    let catch_start = a.here();
    a.pop().ldc_i(2).ret();
    let end = a.here();

    let try_blocks = vec![TryBlock {
        try_start,
        try_end: catch_start,
        handler: TryHandler::Catch(vec![CatchBlock {
            caught_type: CaughtType::Token(error_token),
            start: catch_start,
            // The catch's end offset equals the method's end byte.
            end,
        }]),
    }];
    let (method, _) = add_global_fn(
        &mut b,
        "test.f",
        vec![],
        body_with(a, 0, 1, try_blocks, None),
    );
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    // After finalization the catch end is the emitted stream's byte size.
    match &built.try_blocks[0].handler {
        TryHandler::Catch(catches) => {
            assert_eq!(catches[0].end as usize, built.code.len());
        }
        _ => unreachable!(),
    }
}

#[test]
fn switch_declared_size_matches_emitted_layout() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(1);
    let fixups = a.switch(3);
    a.ldc_i(0).ret();
    for fix in fixups {
        a.bind(fix);
    }
    a.ldc_i(9).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    let decoded = decode(&built.code);
    let switch = decoded
        .iter()
        .find(|d| matches!(d.op, InternalOp::SwitchL | InternalOp::SwitchS))
        .expect("no switch emitted");
    // Header (value + count) + 3 targets, all in the declared size.
    assert_eq!(switch.size, 4 + 8 + 3 * 4);
    assert_eq!(switch.targets.len(), 3);
}

// ---------------------------------------------------------------------------
// Verification failures
// ---------------------------------------------------------------------------

#[test]
fn unresolved_field_token_reports_token_id() {
    let (mut b, _) = single_module();
    let bad = Token::new(TokenKind::Field, 0x1234);
    let mut a = Asm::new();
    a.ldarg(0).ldfld(bad).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![Param::new("x")], body(a, 0, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::UnresolvedTokenId);
    assert_eq!(err.token_id(), Some(bad.0));

    // No partial instruction buffer is produced.
    assert!(!vm.method(method).overloads[0].is_initialized());
}

#[test]
fn inconsistent_stack_height_is_rejected() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldtrue();
    let to_join = a.brfalse();
    a.ldc_i(1).ldc_i(2);
    a.bind(to_join);
    a.pop().pop().retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 2));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::InconsistentStack);
}

#[test]
fn stack_underflow_is_rejected() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.pop().retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::InsufficientStackHeight);
}

#[test]
fn values_left_on_stack_are_rejected() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(1).retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::InsufficientStackHeight);
}

#[test]
fn storing_a_reference_is_rejected() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldlocref(0).stloc(0).retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 1, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::StackHasRefs);
}

#[test]
fn rethrow_outside_catch_is_rejected_at_analysis() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.rethrow();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::General);
    assert!(err.message.contains("rethrow"));
}

#[test]
fn invalid_branch_offset_is_rejected() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    // Branch into the middle of the ldc.i operand.
    let fix = a.br();
    a.ldc_i(1);
    a.bind_at(fix, a.here() - 3);
    a.ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::InvalidBranchOffset);
}

#[test]
fn no_matching_overload_is_reported() {
    let (mut b, _) = single_module();
    let mut helper = Asm::new();
    helper.ldarg(0).ret();
    let (helper_id, helper_token) = add_global_fn(
        &mut b,
        "test.helper",
        vec![Param::new("x")],
        body(helper, 0, 1),
    );
    let mut a = Asm::new();
    a.ldc_i(1).ldc_i(2).scall(helper_token, 2).ret();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 2));
    let vm = b.build();
    let _ = helper_id;

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::NoMatchingOverload);
}

#[test]
fn ref_mismatch_against_declared_signature_is_rejected() {
    let (mut b, _) = single_module();
    let mut helper = Asm::new();
    helper.retnull();
    let (_, helper_token) = add_global_fn(
        &mut b,
        "test.helper",
        vec![Param::by_ref("x")],
        body(helper, 0, 1),
    );
    // Passes a plain value where the helper wants a reference.
    let mut a = Asm::new();
    a.ldc_i(1).scall(helper_token, 1).pop().retnull();
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let err = build_method(&vm, method).unwrap_err();
    assert_eq!(err.kind, MethodInitErrorKind::General);
    assert!(err.message.contains("by reference"), "{}", err.message);
}

#[test]
fn field_access_through_this_takes_the_fast_path() {
    use ovum::runtime::builder::OverloadDef;
    use ovum::runtime::member::Access;
    use ovum::runtime::method::MethodFlags;
    use ovum::runtime::type_info::TypeFlags;

    let (mut b, _) = single_module();
    let object = b.standard().object;
    let (class, class_token) =
        b.add_type("test.C", Access::Public, TypeFlags::empty(), Some(object));
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

    let mut getter = Asm::new();
    getter.ldarg(0).ldfld(field_token).ret();
    let (get_id, get_token) = b.add_method(
        Some(class),
        "get",
        Access::Public,
        MethodFlags::empty(),
        true,
        vec![OverloadDef::bytecode(true, vec![], body(getter, 0, 1))],
    );

    let mut a = Asm::new();
    a.newobj(class_token, 0).stloc(0);
    a.ldloc(0).ldc_i(5).stfld(field_token);
    a.ldloc(0).scall(get_token, 0).ret();
    let (method, _) = add_global_fn(&mut b, "test.main", vec![], body(a, 1, 2));
    let vm = b.build();

    // The getter reads its own field through `this`, so the type check is
    // proven and the unchecked form is emitted.
    let built = build_method(&vm, get_id).unwrap();
    assert!(
        opcodes(&built.code).contains(&InternalOp::LdFldFastS),
        "{:?}",
        opcodes(&built.code)
    );

    // The caller's stfld goes through an untyped local and keeps the check.
    let built = build_method(&vm, method).unwrap();
    assert!(opcodes(&built.code).contains(&InternalOp::StFld));

    let (_, result) = run_method(&vm, method, vec![]);
    assert_eq!(result.unwrap(), Value::Int(5));
}

#[test]
fn unreachable_code_is_removed() {
    let (mut b, _) = single_module();
    let mut a = Asm::new();
    a.ldc_i(1).ret();
    a.ldc_i(2).ret(); // unreachable
    let (method, _) = add_global_fn(&mut b, "test.f", vec![], body(a, 0, 1));
    let vm = b.build();

    let built = build_method(&vm, method).unwrap();
    assert_eq!(
        opcodes(&built.code),
        vec![InternalOp::LdcIS, InternalOp::Ret]
    );
}
