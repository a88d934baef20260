//! Runtime registries: the types, method groups, fields and modules that the
//! instruction stream refers to by index.

pub mod builder;
pub mod member;
pub mod method;
pub mod module;
pub mod standard;
pub mod type_info;

pub use builder::{OverloadBodyDef, OverloadDef, VmBuilder};
pub use member::{Access, Field, FieldStorage, Member, MemberKind, Param};
pub use method::{
    BytecodeBody, CatchBlock, CaughtType, DebugSymbol, DebugSymbols, InitializedBody, Method,
    MethodBody, MethodFlags, MethodOverload, NativeMethod, OverloadFlags, TryBlock, TryHandler,
};
pub use module::{Module, StaticRef, StaticRefBlock};
pub use standard::{NativeFunctions, StandardTypes};
pub use type_info::{Operator, TypeFlags, TypeInfo};
