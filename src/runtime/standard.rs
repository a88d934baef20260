//! The standard `aves` module: the types the runtime cannot operate
//! without, their native operator methods, and the three library
//! initializers the core resolves at startup (List, Hash, and type-token
//! construction).

use std::sync::Arc;

use rustc_hash::FxHashMap;

use ovum_core::{ObjHandle, TypeId, Value};

use crate::gc::heap::{HashKey, ObjectBody};
use crate::runtime::builder::{OverloadDef, VmBuilder};
use crate::runtime::member::{Access, Param};
use crate::runtime::method::MethodFlags;
use crate::runtime::type_info::{Operator, TypeFlags};
use crate::vm::thread::{Abort, Thread};

/// Member name of the indexer accessor pair.
pub const INDEXER_MEMBER: &str = ".item";
/// Member invoked by `lditer`.
pub const ITERATOR_MEMBER: &str = "iter";
/// Member used by string conversion.
pub const TO_STRING_MEMBER: &str = "toString";

/// Field layout of `aves.Error` and its subtypes.
pub mod error_fields {
    pub const MESSAGE: u32 = 0;
    pub const STACK_TRACE: u32 = 1;
    pub const INNER: u32 = 2;
    pub const DATA: u32 = 3;
}

/// Handles to the standard types.
#[derive(Debug, Clone, Copy)]
pub struct StandardTypes {
    pub object: TypeId,
    pub boolean: TypeId,
    pub int: TypeId,
    pub uint: TypeId,
    pub real: TypeId,
    pub string: TypeId,
    pub list: TypeId,
    pub hash: TypeId,
    pub method: TypeId,
    /// `aves.Type`, the type-token wrapper.
    pub type_token: TypeId,
    pub error: TypeId,
    pub type_error: TypeId,
    pub memory_error: TypeId,
    pub overflow_error: TypeId,
    pub divide_by_zero_error: TypeId,
    pub null_reference_error: TypeId,
    pub type_conversion_error: TypeId,
    pub member_not_found_error: TypeId,
    pub no_overload_error: TypeId,
}

impl StandardTypes {
    pub(crate) fn placeholder() -> StandardTypes {
        StandardTypes {
            object: TypeId(0),
            boolean: TypeId(0),
            int: TypeId(0),
            uint: TypeId(0),
            real: TypeId(0),
            string: TypeId(0),
            list: TypeId(0),
            hash: TypeId(0),
            method: TypeId(0),
            type_token: TypeId(0),
            error: TypeId(0),
            type_error: TypeId(0),
            memory_error: TypeId(0),
            overflow_error: TypeId(0),
            divide_by_zero_error: TypeId(0),
            null_reference_error: TypeId(0),
            type_conversion_error: TypeId(0),
            member_not_found_error: TypeId(0),
            no_overload_error: TypeId(0),
        }
    }
}

/// The library initializers the core calls by name, resolved at VM startup
/// and cached.
#[derive(Debug, Clone, Copy)]
pub struct NativeFunctions {
    /// Populates an empty List to the given capacity.
    pub init_list: fn(&mut Thread, ObjHandle, i32) -> Result<(), Abort>,
    /// Populates an empty Hash to the given capacity.
    pub init_hash: fn(&mut Thread, ObjHandle, i32) -> Result<(), Abort>,
    /// Constructs a Type token object around a type handle.
    pub init_type_token: fn(&mut Thread, ObjHandle, TypeId) -> Result<(), Abort>,
}

impl NativeFunctions {
    pub(crate) fn placeholder() -> NativeFunctions {
        fn nop_list(_: &mut Thread, _: ObjHandle, _: i32) -> Result<(), Abort> {
            Ok(())
        }
        fn nop_token(_: &mut Thread, _: ObjHandle, _: TypeId) -> Result<(), Abort> {
            Ok(())
        }
        NativeFunctions {
            init_list: nop_list,
            init_hash: nop_list,
            init_type_token: nop_token,
        }
    }
}

/// Installs the `aves` module into the builder.
pub(crate) fn install(b: &mut VmBuilder) -> (StandardTypes, NativeFunctions) {
    b.begin_module("aves");

    let primitive = TypeFlags::PRIMITIVE | TypeFlags::SEALED;
    let (object, _) = b.add_type("aves.Object", Access::Public, TypeFlags::empty(), None);
    let (boolean, _) = b.add_type("aves.Boolean", Access::Public, primitive, Some(object));
    let (int, _) = b.add_type("aves.Int", Access::Public, primitive, Some(object));
    let (uint, _) = b.add_type("aves.UInt", Access::Public, primitive, Some(object));
    let (real, _) = b.add_type("aves.Real", Access::Public, primitive, Some(object));
    let (string, _) = b.add_type("aves.String", Access::Public, TypeFlags::SEALED, Some(object));
    let (list, _) = b.add_type("aves.List", Access::Public, TypeFlags::SEALED, Some(object));
    let (hash, _) = b.add_type("aves.Hash", Access::Public, TypeFlags::SEALED, Some(object));
    let (method, _) = b.add_type("aves.Method", Access::Public, TypeFlags::SEALED, Some(object));
    let (type_token, _) = b.add_type("aves.Type", Access::Public, TypeFlags::SEALED, Some(object));

    // Reference identity is the default equality; value types override it.
    binary_operator(b, object, Operator::Eq, "op_eq", object_eq);

    install_int(b, int);
    install_uint(b, uint);
    install_real(b, real);
    binary_operator(b, boolean, Operator::Eq, "op_eq", bool_eq);
    unary_operator(b, boolean, Operator::Not, "op_not", bool_not);
    binary_operator(b, string, Operator::Eq, "op_eq", string_eq);
    binary_operator(b, string, Operator::Cmp, "op_cmp", string_cmp);

    install_list(b, list);
    install_hash(b, hash);

    // aves.Type exposes the wrapped type's name.
    let (name_getter, _) = b.add_method(
        Some(type_token),
        "get_name",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(true, vec![], type_name_get)],
    );
    b.add_property(type_token, "name", Access::Public, Some(name_getter), None);

    // The error hierarchy. The field order here is the layout in
    // `error_fields`; every error subtype shares it.
    let (error, _) = b.add_type("aves.Error", Access::Public, TypeFlags::empty(), Some(object));
    b.add_instance_field(error, "message", Access::Public);
    b.add_instance_field(error, "stackTrace", Access::Public);
    b.add_instance_field(error, "innerError", Access::Public);
    b.add_instance_field(error, "data", Access::Public);

    let (error_ctor_id, _) = b.add_method(
        Some(error),
        "new",
        Access::Public,
        MethodFlags::CTOR,
        false,
        vec![
            OverloadDef::native(true, vec![], error_ctor_default),
            OverloadDef::native(true, vec![Param::new("message")], error_ctor),
        ],
    );
    b.set_instance_ctor(error, error_ctor_id);

    let subtype = |b: &mut VmBuilder, name: &str| {
        let (id, _) = b.add_type(name, Access::Public, TypeFlags::empty(), Some(error));
        id
    };
    let type_error = subtype(b, "aves.TypeError");
    let memory_error = subtype(b, "aves.MemoryError");
    let overflow_error = subtype(b, "aves.OverflowError");
    let divide_by_zero_error = subtype(b, "aves.DivideByZeroError");
    let null_reference_error = subtype(b, "aves.NullReferenceError");
    let type_conversion_error = subtype(b, "aves.TypeConversionError");
    let member_not_found_error = subtype(b, "aves.MemberNotFoundError");
    let no_overload_error = subtype(b, "aves.NoOverloadError");

    let types = StandardTypes {
        object,
        boolean,
        int,
        uint,
        real,
        string,
        list,
        hash,
        method,
        type_token,
        error,
        type_error,
        memory_error,
        overflow_error,
        divide_by_zero_error,
        null_reference_error,
        type_conversion_error,
        member_not_found_error,
        no_overload_error,
    };
    let functions = NativeFunctions {
        init_list,
        init_hash,
        init_type_token,
    };
    (types, functions)
}

fn binary_operator(
    b: &mut VmBuilder,
    ty: TypeId,
    op: Operator,
    name: &str,
    body: fn(&mut Thread, u32, usize) -> Result<Value, Abort>,
) {
    let (id, _) = b.add_method(
        Some(ty),
        name,
        Access::Public,
        MethodFlags::STATIC | MethodFlags::IMPL,
        false,
        vec![OverloadDef::native(
            false,
            vec![Param::new("a"), Param::new("b")],
            body,
        )],
    );
    b.set_operator(ty, op, id);
}

fn unary_operator(
    b: &mut VmBuilder,
    ty: TypeId,
    op: Operator,
    name: &str,
    body: fn(&mut Thread, u32, usize) -> Result<Value, Abort>,
) {
    let (id, _) = b.add_method(
        Some(ty),
        name,
        Access::Public,
        MethodFlags::STATIC | MethodFlags::IMPL,
        false,
        vec![OverloadDef::native(false, vec![Param::new("a")], body)],
    );
    b.set_operator(ty, op, id);
}

fn install_int(b: &mut VmBuilder, int: TypeId) {
    binary_operator(b, int, Operator::Add, "op_add", int_add);
    binary_operator(b, int, Operator::Sub, "op_sub", int_sub);
    binary_operator(b, int, Operator::Mul, "op_mul", int_mul);
    binary_operator(b, int, Operator::Div, "op_div", int_div);
    binary_operator(b, int, Operator::Mod, "op_mod", int_mod);
    binary_operator(b, int, Operator::And, "op_and", int_and);
    binary_operator(b, int, Operator::Or, "op_or", int_or);
    binary_operator(b, int, Operator::Xor, "op_xor", int_xor);
    binary_operator(b, int, Operator::Shl, "op_shl", int_shl);
    binary_operator(b, int, Operator::Shr, "op_shr", int_shr);
    binary_operator(b, int, Operator::Eq, "op_eq", int_eq);
    binary_operator(b, int, Operator::Cmp, "op_cmp", int_cmp);
    unary_operator(b, int, Operator::Plus, "op_plus", int_plus);
    unary_operator(b, int, Operator::Neg, "op_neg", int_neg);
    unary_operator(b, int, Operator::Not, "op_not", int_not);
}

fn install_uint(b: &mut VmBuilder, uint: TypeId) {
    binary_operator(b, uint, Operator::Add, "op_add", uint_add);
    binary_operator(b, uint, Operator::Sub, "op_sub", uint_sub);
    binary_operator(b, uint, Operator::Mul, "op_mul", uint_mul);
    binary_operator(b, uint, Operator::Div, "op_div", uint_div);
    binary_operator(b, uint, Operator::Mod, "op_mod", uint_mod);
    binary_operator(b, uint, Operator::Eq, "op_eq", uint_eq);
    binary_operator(b, uint, Operator::Cmp, "op_cmp", uint_cmp);
    unary_operator(b, uint, Operator::Not, "op_not", uint_not);
}

fn install_real(b: &mut VmBuilder, real: TypeId) {
    binary_operator(b, real, Operator::Add, "op_add", real_add);
    binary_operator(b, real, Operator::Sub, "op_sub", real_sub);
    binary_operator(b, real, Operator::Mul, "op_mul", real_mul);
    binary_operator(b, real, Operator::Div, "op_div", real_div);
    binary_operator(b, real, Operator::Eq, "op_eq", real_eq);
    binary_operator(b, real, Operator::Cmp, "op_cmp", real_cmp);
    unary_operator(b, real, Operator::Plus, "op_plus", real_plus);
    unary_operator(b, real, Operator::Neg, "op_neg", real_neg);
}

fn install_list(b: &mut VmBuilder, list: TypeId) {
    let (get, _) = b.add_method(
        Some(list),
        "get_item",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(
            true,
            vec![Param::new("index")],
            list_item_get,
        )],
    );
    let (set, _) = b.add_method(
        Some(list),
        "set_item",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(
            true,
            vec![Param::new("index"), Param::new("value")],
            list_item_set,
        )],
    );
    b.add_property(list, INDEXER_MEMBER, Access::Public, Some(get), Some(set));

    let (length, _) = b.add_method(
        Some(list),
        "get_length",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(true, vec![], list_length)],
    );
    b.add_property(list, "length", Access::Public, Some(length), None);

    b.add_method(
        Some(list),
        "add",
        Access::Public,
        MethodFlags::empty(),
        true,
        vec![OverloadDef::native(
            true,
            vec![Param::new("item")],
            list_add,
        )],
    );
}

fn install_hash(b: &mut VmBuilder, hash: TypeId) {
    let (get, _) = b.add_method(
        Some(hash),
        "get_item",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(
            true,
            vec![Param::new("key")],
            hash_item_get,
        )],
    );
    let (set, _) = b.add_method(
        Some(hash),
        "set_item",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(
            true,
            vec![Param::new("key"), Param::new("value")],
            hash_item_set,
        )],
    );
    b.add_property(hash, INDEXER_MEMBER, Access::Public, Some(get), Some(set));

    let (length, _) = b.add_method(
        Some(hash),
        "get_length",
        Access::Public,
        MethodFlags::empty(),
        false,
        vec![OverloadDef::native(true, vec![], hash_length)],
    );
    b.add_property(hash, "length", Access::Public, Some(length), None);
}

// ---------------------------------------------------------------------------
// Library initializers
// ---------------------------------------------------------------------------

fn init_list(thread: &mut Thread, handle: ObjHandle, capacity: i32) -> Result<(), Abort> {
    let capacity = capacity.max(0) as usize;
    thread
        .vm()
        .gc()
        .with_body_mut(handle, |body| *body = ObjectBody::List(Vec::with_capacity(capacity)));
    Ok(())
}

fn init_hash(thread: &mut Thread, handle: ObjHandle, capacity: i32) -> Result<(), Abort> {
    let capacity = capacity.max(0) as usize;
    thread.vm().gc().with_body_mut(handle, |body| {
        *body = ObjectBody::Hash(FxHashMap::with_capacity_and_hasher(
            capacity,
            Default::default(),
        ));
    });
    Ok(())
}

fn init_type_token(thread: &mut Thread, handle: ObjHandle, wrapped: TypeId) -> Result<(), Abort> {
    thread.vm().gc().write_field(handle, 0, Value::TypeRef(wrapped));
    Ok(())
}

// ---------------------------------------------------------------------------
// Object, Boolean, String
// ---------------------------------------------------------------------------

fn object_eq(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = thread.stack_value(base).clone();
    let b = thread.stack_value(base + 1).clone();
    Ok(Value::Bool(a.same_reference(&b)))
}

fn bool_eq(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = thread.stack_value(base).clone();
    let b = thread.stack_value(base + 1).clone();
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a == b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn bool_not(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    match thread.stack_value(base).clone() {
        Value::Bool(a) => Ok(Value::Bool(!a)),
        _ => thread.throw_type_error("aves.Boolean operator applied to a non-Boolean"),
    }
}

fn string_eq(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = thread.stack_value(base).clone();
    let b = thread.stack_value(base + 1).clone();
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a == b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn string_cmp(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = thread.stack_value(base).clone();
    let b = thread.stack_value(base + 1).clone();
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Int(match a.cmp(&b) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        })),
        _ => thread.throw_type_error("cannot compare a String with a different type"),
    }
}

// ---------------------------------------------------------------------------
// Int operators
// ---------------------------------------------------------------------------

fn int_args(thread: &mut Thread, base: usize) -> Result<(i64, i64), Abort> {
    let a = match thread.stack_value(base) {
        Value::Int(a) => *a,
        _ => return thread.throw_type_error("aves.Int operator applied to a non-Int"),
    };
    let b = match thread.stack_value(base + 1) {
        Value::Int(b) => *b,
        _ => return thread.throw_type_error("the right operand must be an Int"),
    };
    Ok((a, b))
}

fn int_arg(thread: &mut Thread, base: usize) -> Result<i64, Abort> {
    match thread.stack_value(base) {
        Value::Int(a) => Ok(*a),
        _ => thread.throw_type_error("aves.Int operator applied to a non-Int"),
    }
}

fn int_add(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    match a.checked_add(b) {
        Some(v) => Ok(Value::Int(v)),
        None => thread.throw_overflow_error(),
    }
}

fn int_sub(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    match a.checked_sub(b) {
        Some(v) => Ok(Value::Int(v)),
        None => thread.throw_overflow_error(),
    }
}

fn int_mul(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    match a.checked_mul(b) {
        Some(v) => Ok(Value::Int(v)),
        None => thread.throw_overflow_error(),
    }
}

fn int_div(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    // The zero check comes first: 0/0 is a divide-by-zero, not an overflow.
    if b == 0 {
        return thread.throw_divide_by_zero_error();
    }
    match a.checked_div(b) {
        Some(v) => Ok(Value::Int(v)),
        None => thread.throw_overflow_error(),
    }
}

fn int_mod(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    if b == 0 {
        return thread.throw_divide_by_zero_error();
    }
    Ok(Value::Int(a.wrapping_rem(b)))
}

fn int_and(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    Ok(Value::Int(a & b))
}

fn int_or(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    Ok(Value::Int(a | b))
}

fn int_xor(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    Ok(Value::Int(a ^ b))
}

fn int_shl(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    if !(0..64).contains(&b) {
        return thread.throw_overflow_error();
    }
    Ok(Value::Int(a.wrapping_shl(b as u32)))
}

fn int_shr(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    if !(0..64).contains(&b) {
        return thread.throw_overflow_error();
    }
    Ok(Value::Int(a.wrapping_shr(b as u32)))
}

fn int_plus(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    Ok(Value::Int(int_arg(thread, base)?))
}

fn int_neg(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    match int_arg(thread, base)?.checked_neg() {
        Some(v) => Ok(Value::Int(v)),
        None => thread.throw_overflow_error(),
    }
}

fn int_not(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    Ok(Value::Int(!int_arg(thread, base)?))
}

fn int_eq(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = int_arg(thread, base)?;
    match thread.stack_value(base + 1) {
        Value::Int(b) => Ok(Value::Bool(a == *b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn int_cmp(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = int_args(thread, base)?;
    Ok(Value::Int(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

// ---------------------------------------------------------------------------
// UInt operators
// ---------------------------------------------------------------------------

fn uint_args(thread: &mut Thread, base: usize) -> Result<(u64, u64), Abort> {
    let a = match thread.stack_value(base) {
        Value::UInt(a) => *a,
        _ => return thread.throw_type_error("aves.UInt operator applied to a non-UInt"),
    };
    let b = match thread.stack_value(base + 1) {
        Value::UInt(b) => *b,
        _ => return thread.throw_type_error("the right operand must be a UInt"),
    };
    Ok((a, b))
}

fn uint_add(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = uint_args(thread, base)?;
    match a.checked_add(b) {
        Some(v) => Ok(Value::UInt(v)),
        None => thread.throw_overflow_error(),
    }
}

fn uint_sub(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = uint_args(thread, base)?;
    match a.checked_sub(b) {
        Some(v) => Ok(Value::UInt(v)),
        None => thread.throw_overflow_error(),
    }
}

fn uint_mul(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = uint_args(thread, base)?;
    match a.checked_mul(b) {
        Some(v) => Ok(Value::UInt(v)),
        None => thread.throw_overflow_error(),
    }
}

fn uint_div(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = uint_args(thread, base)?;
    if b == 0 {
        return thread.throw_divide_by_zero_error();
    }
    Ok(Value::UInt(a / b))
}

fn uint_mod(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = uint_args(thread, base)?;
    if b == 0 {
        return thread.throw_divide_by_zero_error();
    }
    Ok(Value::UInt(a % b))
}

fn uint_not(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    match thread.stack_value(base) {
        Value::UInt(a) => Ok(Value::UInt(!a)),
        _ => thread.throw_type_error("aves.UInt operator applied to a non-UInt"),
    }
}

fn uint_eq(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = match thread.stack_value(base) {
        Value::UInt(a) => *a,
        _ => return thread.throw_type_error("aves.UInt operator applied to a non-UInt"),
    };
    match thread.stack_value(base + 1) {
        Value::UInt(b) => Ok(Value::Bool(a == *b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn uint_cmp(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = uint_args(thread, base)?;
    Ok(Value::Int(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }))
}

// ---------------------------------------------------------------------------
// Real operators
// ---------------------------------------------------------------------------

fn real_args(thread: &mut Thread, base: usize) -> Result<(f64, f64), Abort> {
    let a = match thread.stack_value(base) {
        Value::Real(a) => *a,
        _ => return thread.throw_type_error("aves.Real operator applied to a non-Real"),
    };
    let b = match thread.stack_value(base + 1) {
        Value::Real(b) => *b,
        Value::Int(b) => *b as f64,
        _ => return thread.throw_type_error("the right operand must be a Real"),
    };
    Ok((a, b))
}

fn real_add(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = real_args(thread, base)?;
    Ok(Value::Real(a + b))
}

fn real_sub(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = real_args(thread, base)?;
    Ok(Value::Real(a - b))
}

fn real_mul(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = real_args(thread, base)?;
    Ok(Value::Real(a * b))
}

fn real_div(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = real_args(thread, base)?;
    Ok(Value::Real(a / b))
}

fn real_eq(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let a = match thread.stack_value(base) {
        Value::Real(a) => *a,
        _ => return thread.throw_type_error("aves.Real operator applied to a non-Real"),
    };
    match thread.stack_value(base + 1) {
        Value::Real(b) => Ok(Value::Bool(a == *b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn real_cmp(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let (a, b) = real_args(thread, base)?;
    match a.partial_cmp(&b) {
        Some(std::cmp::Ordering::Less) => Ok(Value::Int(-1)),
        Some(std::cmp::Ordering::Equal) => Ok(Value::Int(0)),
        Some(std::cmp::Ordering::Greater) => Ok(Value::Int(1)),
        None => thread.throw_type_error("the values cannot be ordered"),
    }
}

fn real_plus(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    match thread.stack_value(base) {
        Value::Real(a) => Ok(Value::Real(*a)),
        _ => thread.throw_type_error("aves.Real operator applied to a non-Real"),
    }
}

fn real_neg(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    match thread.stack_value(base) {
        Value::Real(a) => Ok(Value::Real(-*a)),
        _ => thread.throw_type_error("aves.Real operator applied to a non-Real"),
    }
}

// ---------------------------------------------------------------------------
// Error construction
// ---------------------------------------------------------------------------

fn error_ctor_default(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    if let Value::Object { handle, .. } = this {
        thread.vm().gc().write_field(
            handle,
            error_fields::MESSAGE,
            Value::Str(Arc::from("An error occurred.")),
        );
    }
    Ok(Value::Null)
}

fn error_ctor(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let message = thread.stack_value(base + 1).clone();
    if let Value::Object { handle, .. } = this {
        thread
            .vm()
            .gc()
            .write_field(handle, error_fields::MESSAGE, message);
    }
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// aves.Type
// ---------------------------------------------------------------------------

fn type_name_get(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let Value::Object { handle, .. } = this else {
        return thread.throw_type_error("not a Type object");
    };
    match thread.vm().gc().read_field(handle, 0) {
        Some(Value::TypeRef(ty)) => {
            let name = Arc::clone(&thread.vm().type_info(ty).name);
            Ok(Value::Str(name))
        }
        _ => thread.throw_type_error("not a Type object"),
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

fn object_handle(thread: &mut Thread, value: &Value) -> Result<ObjHandle, Abort> {
    match value {
        Value::Object { handle, .. } => Ok(*handle),
        _ => thread.throw_type_error("not a List object"),
    }
}

fn list_item_get(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let index = match thread.stack_value(base + 1) {
        Value::Int(i) => *i,
        _ => return thread.throw_type_error("the list index must be an Int"),
    };
    let found = thread.vm().gc().with_body(handle, |body| match body {
        ObjectBody::List(values) => {
            usize::try_from(index).ok().and_then(|i| values.get(i).cloned())
        }
        _ => None,
    });
    match found.flatten() {
        Some(value) => Ok(value),
        None => thread.throw_error("the list index is out of range"),
    }
}

fn list_item_set(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let index = match thread.stack_value(base + 1) {
        Value::Int(i) => *i,
        _ => return thread.throw_type_error("the list index must be an Int"),
    };
    let value = thread.stack_value(base + 2).clone();
    let stored = thread.vm().gc().with_body_mut(handle, |body| match body {
        ObjectBody::List(values) => match usize::try_from(index).ok() {
            Some(i) if i < values.len() => {
                values[i] = value;
                true
            }
            _ => false,
        },
        _ => false,
    });
    if stored != Some(true) {
        return thread.throw_error("the list index is out of range");
    }
    Ok(Value::Null)
}

fn list_length(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let len = thread.vm().gc().with_body(handle, |body| match body {
        ObjectBody::List(values) => values.len() as i64,
        _ => 0,
    });
    Ok(Value::Int(len.unwrap_or(0)))
}

fn list_add(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let value = thread.stack_value(base + 1).clone();
    thread.vm().gc().with_body_mut(handle, |body| {
        if let ObjectBody::List(values) = body {
            values.push(value);
        }
    });
    Ok(Value::Null)
}

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

fn hash_key(thread: &mut Thread, value: &Value) -> Result<HashKey, Abort> {
    match HashKey::from_value(value) {
        Some(key) => Ok(key),
        None => thread.throw_type_error("the value cannot be used as a Hash key"),
    }
}

fn hash_item_get(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let key_value = thread.stack_value(base + 1).clone();
    let key = hash_key(thread, &key_value)?;
    let found = thread.vm().gc().with_body(handle, |body| match body {
        ObjectBody::Hash(map) => map.get(&key).cloned(),
        _ => None,
    });
    match found.flatten() {
        Some(value) => Ok(value),
        None => thread.throw_error("the key is not present in the hash"),
    }
}

fn hash_item_set(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let key_value = thread.stack_value(base + 1).clone();
    let key = hash_key(thread, &key_value)?;
    let value = thread.stack_value(base + 2).clone();
    thread.vm().gc().with_body_mut(handle, |body| {
        if let ObjectBody::Hash(map) = body {
            map.insert(key, value);
        }
    });
    Ok(Value::Null)
}

fn hash_length(thread: &mut Thread, _argc: u32, base: usize) -> Result<Value, Abort> {
    let this = thread.stack_value(base).clone();
    let handle = object_handle(thread, &this)?;
    let len = thread.vm().gc().with_body(handle, |body| match body {
        ObjectBody::Hash(map) => map.len() as i64,
        _ => 0,
    });
    Ok(Value::Int(len.unwrap_or(0)))
}
