//! Members: fields, parameters, and the per-type member map entries.

use std::sync::Arc;

use ovum_core::{MethodId, StaticId, TypeId};

/// Member accessibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
    Private,
}

/// One declared parameter of a method overload. The instance is implicit and
/// never listed.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Arc<str>,
    /// The parameter is passed by reference.
    pub is_ref: bool,
    /// The parameter packs surplus arguments into a List. Only valid on the
    /// last parameter, and mutually exclusive with `is_ref`.
    pub is_variadic: bool,
}

impl Param {
    pub fn new(name: &str) -> Param {
        Param {
            name: Arc::from(name),
            is_ref: false,
            is_variadic: false,
        }
    }

    pub fn by_ref(name: &str) -> Param {
        Param {
            name: Arc::from(name),
            is_ref: true,
            is_variadic: false,
        }
    }

    pub fn variadic(name: &str) -> Param {
        Param {
            name: Arc::from(name),
            is_ref: false,
            is_variadic: true,
        }
    }
}

/// Where a field's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStorage {
    /// Index into the instance's field array.
    Instance(u32),
    /// A slot in the declaring module's static reference block.
    Static(StaticId),
}

/// A declared field.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: Arc<str>,
    /// The declaring type; `None` for module-level fields.
    pub decl_type: Option<TypeId>,
    pub access: Access,
    pub storage: FieldStorage,
}

impl Field {
    pub fn is_static(&self) -> bool {
        matches!(self.storage, FieldStorage::Static(_))
    }

    /// The instance field index. Only valid on instance fields.
    pub fn instance_index(&self) -> u32 {
        match self.storage {
            FieldStorage::Instance(i) => i,
            FieldStorage::Static(_) => panic!("static field has no instance index"),
        }
    }
}

/// What a member-map entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field(ovum_core::FieldId),
    Method(MethodId),
    Property {
        getter: Option<MethodId>,
        setter: Option<MethodId>,
    },
}

/// One entry in a type's member map.
#[derive(Debug, Clone, Copy)]
pub struct Member {
    pub access: Access,
    pub kind: MemberKind,
}
