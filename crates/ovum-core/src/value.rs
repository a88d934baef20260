//! The universal value representation.
//!
//! A value is a type tag plus an 8-byte payload in the original design; here
//! it is an enum, with dedicated variants for the three reference kinds that
//! the original encoded as reserved sentinel tags. References are transient
//! eval-stack values only: the verifier guarantees they are never stored in
//! locals or static slots.

use std::sync::Arc;

use crate::ids::{MethodId, ObjHandle, StaticId, TypeId};

/// A single Ovum value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value.
    Null,
    /// A Boolean primitive.
    Bool(bool),
    /// A signed 64-bit integer primitive.
    Int(i64),
    /// An unsigned 64-bit integer primitive.
    UInt(u64),
    /// A 64-bit floating-point primitive.
    Real(f64),
    /// An interned or constructed string.
    Str(Arc<str>),
    /// An enum-typed primitive: the declaring type plus the numeric value.
    Enum(TypeId, i64),
    /// A heap object.
    Object { type_id: TypeId, handle: ObjHandle },
    /// Reference to a slot on the owning thread's call stack (an argument,
    /// local variable or eval-stack slot). Sound because frames never move
    /// and the verifier keeps references from outliving their frame.
    LocalRef(usize),
    /// Reference to a static field cell.
    StaticRef(StaticId),
    /// Reference to a field of a heap object.
    FieldRef { object: ObjHandle, field: u32 },
    /// Internal payload of an `aves.Method` object: the target method group.
    /// Never appears on the evaluation stack.
    FnRef(MethodId),
    /// Internal payload of an `aves.Type` object: the wrapped type handle.
    /// Never appears on the evaluation stack.
    TypeRef(TypeId),
}

impl Value {
    /// Whether this value is one of the three reference kinds.
    pub fn is_ref(&self) -> bool {
        matches!(
            self,
            Value::LocalRef(_) | Value::StaticRef(_) | Value::FieldRef { .. }
        )
    }

    /// Truthiness: null is false, primitives are false when their payload is
    /// all zero bits, everything else is true.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Real(r) => r.to_bits() != 0,
            Value::Enum(_, v) => *v != 0,
            _ => true,
        }
    }

    pub fn is_false(&self) -> bool {
        !self.is_true()
    }

    /// Reference identity, as used by `brref`/`brnref`: same tag and same
    /// payload. Primitives compare by payload bits, strings by pointer
    /// identity (interned strings share storage), objects by handle.
    pub fn same_reference(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b),
            (Value::Enum(at, av), Value::Enum(bt, bv)) => at == bt && av == bv,
            (
                Value::Object { handle: a, .. },
                Value::Object { handle: b, .. },
            ) => a == b,
            (Value::LocalRef(a), Value::LocalRef(b)) => a == b,
            (Value::StaticRef(a), Value::StaticRef(b)) => a == b,
            (
                Value::FieldRef { object: ao, field: af },
                Value::FieldRef { object: bo, field: bf },
            ) => ao == bo && af == bf,
            (Value::FnRef(a), Value::FnRef(b)) => a == b,
            (Value::TypeRef(a), Value::TypeRef(b)) => a == b,
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Value {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_true());
        assert!(!Value::Bool(false).is_true());
        assert!(Value::Bool(true).is_true());
        assert!(!Value::Int(0).is_true());
        assert!(Value::Int(-1).is_true());
        assert!(!Value::Real(0.0).is_true());
        // Negative zero has a sign bit, so it is true under payload semantics.
        assert!(Value::Real(-0.0).is_true());
        assert!(Value::Str(Arc::from("")).is_true());
    }

    #[test]
    fn reference_identity() {
        let a: Arc<str> = Arc::from("x");
        let b: Arc<str> = Arc::from("x");
        assert!(Value::Str(a.clone()).same_reference(&Value::Str(a.clone())));
        assert!(!Value::Str(a).same_reference(&Value::Str(b)));
        assert!(Value::Null.same_reference(&Value::Null));
        assert!(!Value::Int(1).same_reference(&Value::UInt(1)));
    }

    #[test]
    fn ref_detection() {
        assert!(Value::LocalRef(3).is_ref());
        assert!(!Value::Int(3).is_ref());
    }
}
