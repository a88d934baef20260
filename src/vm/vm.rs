//! The VM instance: immutable registries, the GC, and the entry points.
//!
//! A [`Vm`] is built once (see `runtime::builder`) and shared between
//! threads behind an `Arc`. All load-time state — types, method groups,
//! fields, modules, strings — is frozen at build time; the mutable pieces
//! (method bodies, static fields, type initialization state, the heap) have
//! their own interior synchronization.

use std::sync::Arc;

use ovum_core::{
    FieldId, MethodId, ModuleId, RefSignaturePool, StaticId, StrId, TypeId, Value, exit_code,
};

use crate::gc::Gc;
use crate::runtime::member::Member;
use crate::runtime::method::Method;
use crate::runtime::module::{Module, StaticRef};
use crate::runtime::standard::{NativeFunctions, StandardTypes, error_fields};
use crate::runtime::type_info::{Operator, TypeInfo};
use crate::vm::thread::{Abort, Thread};

pub struct Vm {
    pub(crate) types: Vec<TypeInfo>,
    pub(crate) methods: Vec<Method>,
    pub(crate) fields: Vec<crate::runtime::member::Field>,
    pub(crate) modules: Vec<Module>,
    pub(crate) strings: Vec<Arc<str>>,
    pub standard: StandardTypes,
    pub functions: NativeFunctions,
    pub(crate) ref_signatures: RefSignaturePool,
    pub(crate) gc: Gc,
}

impl Vm {
    // ------------------------------------------------------------------
    // Registry access
    // ------------------------------------------------------------------

    pub fn type_info(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0 as usize]
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.0 as usize]
    }

    pub fn field(&self, id: FieldId) -> &crate::runtime::member::Field {
        &self.fields[id.0 as usize]
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn string(&self, id: StrId) -> &Arc<str> {
        &self.strings[id.0 as usize]
    }

    pub fn static_ref(&self, id: StaticId) -> &StaticRef {
        &self.module(id.module).statics.values[id.slot as usize]
    }

    pub fn gc(&self) -> &Gc {
        &self.gc
    }

    pub fn ref_signatures(&self) -> &RefSignaturePool {
        &self.ref_signatures
    }

    /// The qualified name of a method group: `Type.name` for class methods,
    /// the plain (already qualified) name for global functions.
    pub fn qualified_method_name(&self, id: MethodId) -> Arc<str> {
        let method = self.method(id);
        match method.decl_type {
            Some(ty) => Arc::from(format!("{}.{}", self.type_info(ty).name, method.name)),
            None => Arc::clone(&method.name),
        }
    }

    // ------------------------------------------------------------------
    // Type relationships
    // ------------------------------------------------------------------

    /// Whether `sub` is `sup` or derives from it.
    pub fn is_same_or_derived(&self, sub: TypeId, sup: TypeId) -> bool {
        let mut current = Some(sub);
        while let Some(id) = current {
            if id == sup {
                return true;
            }
            current = self.type_info(id).base;
        }
        false
    }

    /// The runtime type of a value, when it has one. Null and transient
    /// references have no type.
    pub fn value_type_id(&self, value: &Value) -> Option<TypeId> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(self.standard.boolean),
            Value::Int(_) => Some(self.standard.int),
            Value::UInt(_) => Some(self.standard.uint),
            Value::Real(_) => Some(self.standard.real),
            Value::Str(_) => Some(self.standard.string),
            Value::Enum(ty, _) => Some(*ty),
            Value::Object { type_id, .. } => Some(*type_id),
            Value::LocalRef(_)
            | Value::StaticRef(_)
            | Value::FieldRef { .. }
            | Value::FnRef(_)
            | Value::TypeRef(_) => None,
        }
    }

    /// Whether a value is of the given type or a derived one. Null is never
    /// of any type.
    pub fn value_is_type(&self, value: &Value, ty: TypeId) -> bool {
        match self.value_type_id(value) {
            Some(actual) => self.is_same_or_derived(actual, ty),
            None => false,
        }
    }

    /// Looks up a named member, walking the base chain. Returns the
    /// declaring type alongside the member.
    pub fn lookup_member(&self, ty: TypeId, name: &str) -> Option<(TypeId, Member)> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let info = self.type_info(id);
            if let Some(member) = info.members.get(name) {
                return Some((id, *member));
            }
            current = info.base;
        }
        None
    }

    /// Looks up an operator implementation, walking the base chain.
    pub fn lookup_operator(&self, ty: TypeId, op: Operator) -> Option<MethodId> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let info = self.type_info(id);
            if let Some(method) = info.operator(op) {
                return Some(method);
            }
            current = info.base;
        }
        None
    }

    /// Accessibility of a member declared on `decl_type` (or at module level
    /// in `decl_module`) from code whose declaring type is `from_type` in
    /// `from_module`.
    pub fn is_accessible(
        &self,
        access: crate::runtime::member::Access,
        decl_type: Option<TypeId>,
        decl_module: ModuleId,
        from_type: Option<TypeId>,
        from_module: ModuleId,
    ) -> bool {
        use crate::runtime::member::Access;
        match access {
            Access::Public => true,
            Access::Private => match decl_type {
                Some(decl) => from_type == Some(decl),
                None => decl_module == from_module,
            },
            Access::Protected => match (decl_type, from_type) {
                (Some(decl), Some(from)) => self.is_same_or_derived(from, decl),
                _ => false,
            },
        }
    }

    // ------------------------------------------------------------------
    // Entry points and failure reporting
    // ------------------------------------------------------------------

    /// Runs a module's main method with the given arguments and maps the
    /// outcome to a process exit code, printing uncaught failures to stderr.
    pub fn run(self: &Arc<Vm>, module: ModuleId, args: Vec<Value>) -> i32 {
        let Some(main) = self.module(module).main else {
            eprintln!("error: module '{}' has no main method", self.module(module).name);
            return exit_code::METHOD_INIT_FAILED;
        };
        let group = self.method(main);
        let Some((_, overload)) = group.resolve_overload(args.len() as u32) else {
            eprintln!(
                "error: no overload of '{}' accepts {} argument(s)",
                self.qualified_method_name(main),
                args.len()
            );
            return exit_code::METHOD_INIT_FAILED;
        };
        let overload = Arc::clone(overload);

        let mut thread = Thread::new(Arc::clone(self));
        match thread.start(&overload, args) {
            Ok(_) => exit_code::SUCCESS,
            Err(Abort::Thrown) => {
                self.print_unhandled_error(&thread);
                exit_code::ERROR_THROWN
            }
            Err(Abort::MethodInit(err)) => {
                eprintln!("error: {err}");
                exit_code::METHOD_INIT_FAILED
            }
            Err(Abort::Fatal(err)) => {
                eprintln!("fatal error: {err}");
                err.exit_code()
            }
        }
    }

    /// Prints an uncaught managed error: type, message, stack trace, then
    /// the inner-error chain and attached data.
    pub fn print_unhandled_error(&self, thread: &Thread) {
        eprintln!("An error occurred and was not caught:");
        let mut error = thread.current_error().clone();
        let mut first = true;
        loop {
            let type_name: Arc<str> = match self.value_type_id(&error) {
                Some(ty) => Arc::clone(&self.type_info(ty).name),
                None => Arc::from("<no type>"),
            };
            let prefix = if first { "" } else { "Caused by: " };
            eprintln!("{prefix}{type_name}: {}", self.error_text(&error, error_fields::MESSAGE));

            let trace = self.error_text(&error, error_fields::STACK_TRACE);
            if !trace.is_empty() {
                eprintln!("{trace}");
            }
            if let Some(data) = self.error_field(&error, error_fields::DATA) {
                if data != Value::Null {
                    eprintln!("  data: {data:?}");
                }
            }

            match self.error_field(&error, error_fields::INNER) {
                Some(inner) if inner != Value::Null => {
                    error = inner;
                    first = false;
                }
                _ => break,
            }
        }
    }

    fn error_field(&self, error: &Value, index: u32) -> Option<Value> {
        match error {
            Value::Object { handle, .. } => self.gc.read_field(*handle, index),
            _ => None,
        }
    }

    fn error_text(&self, error: &Value, index: u32) -> String {
        match self.error_field(error, index) {
            Some(Value::Str(s)) => s.to_string(),
            _ => String::new(),
        }
    }
}
