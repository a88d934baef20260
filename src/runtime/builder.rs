//! Registration API for modules, types, fields and methods.
//!
//! The loader (and the test suites) describe their modules through a
//! [`VmBuilder`]; `build` freezes everything into an immutable [`Vm`]. The
//! standard `aves` module is installed first, so the runtime's required
//! types are always present.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use ovum_core::{
    FieldId, MethodId, ModuleId, RefSignatureBuilder, RefSignaturePool, StaticId, StrId, Token,
    TokenKind, TypeId,
};

use crate::gc::Gc;
use crate::runtime::member::{Access, Field, FieldStorage, Member, MemberKind, Param};
use crate::runtime::method::{
    BytecodeBody, Method, MethodBody, MethodFlags, MethodOverload, NativeMethod, OverloadFlags,
};
use crate::runtime::module::{Module, StaticRefBlock};
use crate::runtime::standard;
use crate::runtime::type_info::{Operator, TypeFlags, TypeInfo};
use crate::vm::vm::Vm;

/// One overload being registered.
pub struct OverloadDef {
    pub instance: bool,
    pub params: Vec<Param>,
    pub body: OverloadBodyDef,
}

pub enum OverloadBodyDef {
    Native(NativeMethod),
    Bytecode(BytecodeBody),
}

impl OverloadDef {
    pub fn native(instance: bool, params: Vec<Param>, body: NativeMethod) -> OverloadDef {
        OverloadDef {
            instance,
            params,
            body: OverloadBodyDef::Native(body),
        }
    }

    pub fn bytecode(instance: bool, params: Vec<Param>, body: BytecodeBody) -> OverloadDef {
        OverloadDef {
            instance,
            params,
            body: OverloadBodyDef::Bytecode(body),
        }
    }
}

struct ModuleScaffold {
    name: Arc<str>,
    types: Vec<TypeId>,
    methods: Vec<MethodId>,
    fields: Vec<FieldId>,
    strings: Vec<StrId>,
    static_count: u32,
    main: Option<MethodId>,
}

pub struct VmBuilder {
    types: Vec<TypeInfo>,
    methods: Vec<Method>,
    fields: Vec<Field>,
    modules: Vec<ModuleScaffold>,
    strings: Vec<Arc<str>>,
    string_index: FxHashMap<Arc<str>, StrId>,
    ref_signatures: RefSignaturePool,
    current: ModuleId,
    standard: standard::StandardTypes,
    functions: standard::NativeFunctions,
    gc_capacity: Option<usize>,
}

impl VmBuilder {
    /// Creates a builder with the standard `aves` module already installed.
    pub fn new() -> VmBuilder {
        let mut builder = VmBuilder {
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            modules: Vec::new(),
            strings: Vec::new(),
            string_index: FxHashMap::default(),
            ref_signatures: RefSignaturePool::new(),
            current: ModuleId(0),
            // Placeholders; standard::install replaces them immediately.
            standard: standard::StandardTypes::placeholder(),
            functions: standard::NativeFunctions::placeholder(),
            gc_capacity: None,
        };
        let (types, functions) = standard::install(&mut builder);
        builder.standard = types;
        builder.functions = functions;
        builder
    }

    pub fn standard(&self) -> &standard::StandardTypes {
        &self.standard
    }

    /// Caps the number of live heap objects; allocation beyond the cap
    /// reports out-of-memory. Used to exercise memory-error paths.
    pub fn set_gc_capacity(&mut self, capacity: usize) {
        self.gc_capacity = Some(capacity);
    }

    /// Opens a new module; subsequent registrations land in it.
    pub fn begin_module(&mut self, name: &str) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(ModuleScaffold {
            name: Arc::from(name),
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            strings: Vec::new(),
            static_count: 0,
            main: None,
        });
        self.current = id;
        id
    }

    fn current_module(&mut self) -> &mut ModuleScaffold {
        &mut self.modules[self.current.0 as usize]
    }

    /// Interns a string into the current module's string table. Returns the
    /// global id and the module-local token.
    pub fn add_string(&mut self, value: &str) -> (StrId, Token) {
        let id = match self.string_index.get(value) {
            Some(id) => *id,
            None => {
                let id = StrId(self.strings.len() as u32);
                let arc: Arc<str> = Arc::from(value);
                self.strings.push(Arc::clone(&arc));
                self.string_index.insert(arc, id);
                id
            }
        };
        let module = self.current_module();
        let token = Token::new(TokenKind::String, module.strings.len() as u32);
        module.strings.push(id);
        (id, token)
    }

    /// Adds an already-registered type to the current module's token table,
    /// as the loader does for imported types.
    pub fn import_type(&mut self, type_id: TypeId) -> Token {
        let module = self.current_module();
        let token = Token::new(TokenKind::Type, module.types.len() as u32);
        module.types.push(type_id);
        token
    }

    /// Adds an already-registered method group to the current module's token
    /// table.
    pub fn import_method(&mut self, method: MethodId) -> Token {
        let module = self.current_module();
        let token = Token::new(TokenKind::Method, module.methods.len() as u32);
        module.methods.push(method);
        token
    }

    /// Adds an already-registered field to the current module's token table.
    pub fn import_field(&mut self, field: FieldId) -> Token {
        let module = self.current_module();
        let token = Token::new(TokenKind::Field, module.fields.len() as u32);
        module.fields.push(field);
        token
    }

    pub fn add_type(
        &mut self,
        name: &str,
        access: Access,
        flags: TypeFlags,
        base: Option<TypeId>,
    ) -> (TypeId, Token) {
        let id = TypeId(self.types.len() as u32);
        let mut info = TypeInfo::new(name, self.current, access, flags);
        info.base = base;
        if let Some(base) = base {
            let parent = &self.types[base.0 as usize];
            info.field_count = parent.field_count;
            info.instance_ctor = parent.instance_ctor;
        }
        self.types.push(info);
        let module = self.current_module();
        let token = Token::new(TokenKind::Type, module.types.len() as u32);
        module.types.push(id);
        (id, token)
    }

    pub fn add_instance_field(
        &mut self,
        decl_type: TypeId,
        name: &str,
        access: Access,
    ) -> (FieldId, Token) {
        let index = self.types[decl_type.0 as usize].field_count;
        self.types[decl_type.0 as usize].field_count += 1;

        let id = FieldId(self.fields.len() as u32);
        self.fields.push(Field {
            name: Arc::from(name),
            decl_type: Some(decl_type),
            access,
            storage: FieldStorage::Instance(index),
        });
        self.types[decl_type.0 as usize].members.insert(
            Arc::from(name),
            Member {
                access,
                kind: MemberKind::Field(id),
            },
        );
        let module = self.current_module();
        let token = Token::new(TokenKind::Field, module.fields.len() as u32);
        module.fields.push(id);
        (id, token)
    }

    pub fn add_static_field(
        &mut self,
        decl_type: Option<TypeId>,
        name: &str,
        access: Access,
    ) -> (FieldId, Token) {
        let slot = {
            let module = self.current_module();
            let slot = module.static_count;
            module.static_count += 1;
            slot
        };
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(Field {
            name: Arc::from(name),
            decl_type,
            access,
            storage: FieldStorage::Static(StaticId {
                module: self.current,
                slot,
            }),
        });
        if let Some(ty) = decl_type {
            self.types[ty.0 as usize].members.insert(
                Arc::from(name),
                Member {
                    access,
                    kind: MemberKind::Field(id),
                },
            );
        }
        let module = self.current_module();
        let token = Token::new(TokenKind::Field, module.fields.len() as u32);
        module.fields.push(id);
        (id, token)
    }

    /// Registers a method group. When `as_member` and the group has a
    /// declaring type, it is entered into that type's member map.
    pub fn add_method(
        &mut self,
        decl_type: Option<TypeId>,
        name: &str,
        access: Access,
        flags: MethodFlags,
        as_member: bool,
        overloads: Vec<OverloadDef>,
    ) -> (MethodId, Token) {
        let id = MethodId(self.methods.len() as u32);
        let built: Vec<Arc<MethodOverload>> = overloads
            .into_iter()
            .map(|def| {
                let mut oflags = OverloadFlags::empty();
                if def.instance {
                    oflags |= OverloadFlags::INSTANCE;
                }
                if def.params.last().is_some_and(|p| p.is_variadic) {
                    oflags |= OverloadFlags::VARIADIC;
                }
                let ref_signature = Self::ref_signature_of(&self.ref_signatures, &def.params);
                let body = match def.body {
                    OverloadBodyDef::Native(native) => MethodBody::Native(native),
                    OverloadBodyDef::Bytecode(body) => MethodBody::Bytecode(body),
                };
                Arc::new(MethodOverload::new(
                    id,
                    self.current,
                    oflags,
                    def.params,
                    ref_signature,
                    body,
                ))
            })
            .collect();

        self.methods.push(Method {
            name: Arc::from(name),
            decl_type,
            module: self.current,
            access,
            flags,
            overloads: built,
        });

        if as_member {
            if let Some(ty) = decl_type {
                self.types[ty.0 as usize].members.insert(
                    Arc::from(name),
                    Member {
                        access,
                        kind: MemberKind::Method(id),
                    },
                );
            }
        }

        let module = self.current_module();
        let token = Token::new(TokenKind::Method, module.methods.len() as u32);
        module.methods.push(id);
        (id, token)
    }

    fn ref_signature_of(pool: &RefSignaturePool, params: &[Param]) -> u32 {
        let mut builder = RefSignatureBuilder::new(params.len() as u32 + 1);
        for (i, param) in params.iter().enumerate() {
            if param.is_ref {
                builder.set_param(i as u32 + 1, true);
            }
        }
        builder.commit(pool)
    }

    pub fn add_property(
        &mut self,
        decl_type: TypeId,
        name: &str,
        access: Access,
        getter: Option<MethodId>,
        setter: Option<MethodId>,
    ) {
        self.types[decl_type.0 as usize].members.insert(
            Arc::from(name),
            Member {
                access,
                kind: MemberKind::Property { getter, setter },
            },
        );
    }

    pub fn set_instance_ctor(&mut self, decl_type: TypeId, ctor: MethodId) {
        self.types[decl_type.0 as usize].instance_ctor = Some(ctor);
    }

    pub fn set_static_ctor(&mut self, decl_type: TypeId, ctor: MethodId) {
        self.types[decl_type.0 as usize].static_ctor = Some(ctor);
    }

    pub fn set_operator(&mut self, decl_type: TypeId, op: Operator, method: MethodId) {
        self.types[decl_type.0 as usize].operators[op as usize] = Some(method);
    }

    pub fn set_main(&mut self, method: MethodId) {
        self.current_module().main = Some(method);
    }

    /// The reference-signature pool, for callers that build bytecode bodies
    /// with declared signatures.
    pub fn ref_signatures(&self) -> &RefSignaturePool {
        &self.ref_signatures
    }

    pub fn build(self) -> Arc<Vm> {
        let modules = self
            .modules
            .into_iter()
            .map(|scaffold| Module {
                name: scaffold.name,
                types: scaffold.types,
                methods: scaffold.methods,
                fields: scaffold.fields,
                strings: scaffold.strings,
                statics: StaticRefBlock::new(scaffold.static_count as usize),
                main: scaffold.main,
            })
            .collect();

        Arc::new(Vm {
            types: self.types,
            methods: self.methods,
            fields: self.fields,
            modules,
            strings: self.strings,
            standard: self.standard,
            functions: self.functions,
            ref_signatures: self.ref_signatures,
            gc: Gc::new(self.gc_capacity),
        })
    }
}

impl Default for VmBuilder {
    fn default() -> VmBuilder {
        VmBuilder::new()
    }
}
