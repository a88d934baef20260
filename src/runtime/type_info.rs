//! Type descriptors and operator identities.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;

use ovum_core::{MethodId, ModuleId, TypeId};

use crate::runtime::member::{Access, Member};

bitflags! {
    /// Structural properties of a type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const ABSTRACT  = 0x01;
        const STATIC    = 0x02;
        const PRIMITIVE = 0x04;
        const SEALED    = 0x08;
    }
}

/// The overloadable operators. All are unary or binary; the implementing
/// method is always resolved through the first operand's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Operator {
    Add = 0,
    Sub = 1,
    Or = 2,
    Xor = 3,
    Mul = 4,
    Div = 5,
    Mod = 6,
    And = 7,
    Shl = 8,
    Shr = 9,
    Plus = 10,
    Neg = 11,
    Not = 12,
    Eq = 13,
    Cmp = 14,
}

impl Operator {
    pub const COUNT: usize = 15;

    pub fn arity(self) -> u32 {
        match self {
            Operator::Plus | Operator::Neg | Operator::Not => 1,
            _ => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Or => "|",
            Operator::Xor => "^",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::And => "&",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::Plus => "+x",
            Operator::Neg => "-x",
            Operator::Not => "~",
            Operator::Eq => "==",
            Operator::Cmp => "<=>",
        }
    }
}

/// State of a type's static constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticCtorState {
    NotRun,
    Running,
    Done,
}

/// A runtime type.
#[derive(Debug)]
pub struct TypeInfo {
    /// Fully qualified name, e.g. `aves.Int`.
    pub name: Arc<str>,
    pub module: ModuleId,
    pub access: Access,
    pub flags: TypeFlags,
    pub base: Option<TypeId>,
    /// Named members declared on this type. Lookup walks the base chain.
    pub members: FxHashMap<Arc<str>, Member>,
    /// Operator implementations, indexed by `Operator as usize`.
    pub operators: [Option<MethodId>; Operator::COUNT],
    /// The instance constructor group, when the type is constructible.
    pub instance_ctor: Option<MethodId>,
    /// The static constructor, run before the first method that touches the
    /// type's static state executes.
    pub static_ctor: Option<MethodId>,
    /// Number of instance fields, including inherited ones.
    pub field_count: u32,

    static_ctor_state: AtomicU8,
}

impl TypeInfo {
    pub fn new(name: &str, module: ModuleId, access: Access, flags: TypeFlags) -> TypeInfo {
        TypeInfo {
            name: Arc::from(name),
            module,
            access,
            flags,
            base: None,
            members: FxHashMap::default(),
            operators: [None; Operator::COUNT],
            instance_ctor: None,
            static_ctor: None,
            field_count: 0,
            static_ctor_state: AtomicU8::new(0),
        }
    }

    pub fn is_primitive(&self) -> bool {
        self.flags.contains(TypeFlags::PRIMITIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(TypeFlags::ABSTRACT)
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(TypeFlags::STATIC)
    }

    pub fn operator(&self, op: Operator) -> Option<MethodId> {
        self.operators[op as usize]
    }

    pub fn static_ctor_state(&self) -> StaticCtorState {
        match self.static_ctor_state.load(Ordering::Acquire) {
            0 => StaticCtorState::NotRun,
            1 => StaticCtorState::Running,
            _ => StaticCtorState::Done,
        }
    }

    /// Attempts to claim the static constructor for this thread. Returns
    /// false when it already ran or is running (possibly further up the
    /// current call chain).
    pub fn begin_static_ctor(&self) -> bool {
        self.static_ctor_state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_static_ctor(&self) {
        self.static_ctor_state.store(2, Ordering::Release);
    }

    /// The last component of the qualified name, used by the stack-trace
    /// formatter.
    pub fn short_name(&self) -> &str {
        match self.name.rfind('.') {
            Some(dot) => &self.name[dot + 1..],
            None => &self.name,
        }
    }
}
