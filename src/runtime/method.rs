//! Method groups, overloads, protected regions and debug symbols.
//!
//! A method group carries a name and one or more overloads. Each bytecode
//! overload arrives from the loader uninitialized: a source byte array plus
//! declared counts and try blocks whose offsets are in source-bytecode byte
//! units. On first invocation the initialization pipeline produces the
//! executable [`InitializedBody`], with try-block and debug-symbol offsets
//! rewritten into the emitted stream's byte units. Installation is a
//! double-checked publish: losers of an initialization race discard their
//! buffer, and readers always observe a fully built body.

use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use ovum_core::{MethodId, ModuleId, RefSignaturePool, Token, TypeId, Value};

use crate::runtime::member::{Access, Param};
use crate::vm::thread::{Abort, Thread};

bitflags! {
    /// Properties of a method group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u32 {
        const STATIC = 0x01;
        const CTOR   = 0x02;
        const IMPL   = 0x04;
    }
}

bitflags! {
    /// Properties of a single overload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OverloadFlags: u32 {
        const INSTANCE = 0x01;
        const VARIADIC = 0x02;
    }
}

/// A protected region, in whatever offset units the current phase uses:
/// source byte offsets as loaded, builder instruction indices during
/// initialization, and emitted byte offsets afterwards. Regions are listed
/// innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct TryBlock {
    pub try_start: u32,
    pub try_end: u32,
    pub handler: TryHandler,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TryHandler {
    Catch(Vec<CatchBlock>),
    Finally { start: u32, end: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchBlock {
    /// The caught type: a type token as loaded, resolved to a [`TypeId`]
    /// during parsing.
    pub caught_type: CaughtType,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaughtType {
    Token(Token),
    Resolved(TypeId),
}

impl CaughtType {
    pub fn resolved(self) -> TypeId {
        match self {
            CaughtType::Resolved(id) => id,
            CaughtType::Token(tok) => panic!("caught type still unresolved: {tok}"),
        }
    }
}

/// Debug symbols for one overload: source ranges mapped to lines of a file.
/// Offsets are translated alongside the try blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugSymbols {
    pub file: Arc<str>,
    pub symbols: Vec<DebugSymbol>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebugSymbol {
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

impl DebugSymbols {
    /// The symbol covering the given offset, if any.
    pub fn find(&self, offset: u32) -> Option<&DebugSymbol> {
        self.symbols
            .iter()
            .find(|s| offset >= s.start && offset < s.end)
    }
}

/// The uninitialized body of a bytecode overload, as loaded from a module.
#[derive(Debug)]
pub struct BytecodeBody {
    pub code: Box<[u8]>,
    pub locals: u32,
    pub max_stack: u32,
    pub try_blocks: Vec<TryBlock>,
    pub debug_symbols: Option<DebugSymbols>,
}

/// A native method implementation. Receives the argument count (including
/// the instance) and the absolute stack slot of the first argument.
pub type NativeMethod = fn(&mut Thread, u32, usize) -> Result<Value, Abort>;

#[derive(Debug)]
pub enum MethodBody {
    Bytecode(BytecodeBody),
    Native(NativeMethod),
}

/// The executable form of a bytecode overload: the emitted instruction
/// buffer plus try blocks and debug symbols in emitted byte offsets.
/// Read-only after initialization.
#[derive(Debug)]
pub struct InitializedBody {
    pub code: Box<[u8]>,
    pub try_blocks: Vec<TryBlock>,
    pub debug_symbols: Option<DebugSymbols>,
    pub locals: u32,
    pub max_stack: u32,
}

/// One overload of a method group.
#[derive(Debug)]
pub struct MethodOverload {
    pub group: MethodId,
    pub module: ModuleId,
    pub flags: OverloadFlags,
    pub params: Vec<Param>,
    /// The declared reference signature token (bit 0 = instance).
    pub ref_signature: u32,
    pub body: MethodBody,
    init: OnceLock<Arc<InitializedBody>>,
}

impl MethodOverload {
    pub fn new(
        group: MethodId,
        module: ModuleId,
        flags: OverloadFlags,
        params: Vec<Param>,
        ref_signature: u32,
        body: MethodBody,
    ) -> MethodOverload {
        MethodOverload {
            group,
            module,
            flags,
            params,
            ref_signature,
            body,
            init: OnceLock::new(),
        }
    }

    pub fn is_instance(&self) -> bool {
        self.flags.contains(OverloadFlags::INSTANCE)
    }

    pub fn is_variadic(&self) -> bool {
        self.flags.contains(OverloadFlags::VARIADIC)
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, MethodBody::Native(_))
    }

    /// 1 when the overload takes an instance, else 0.
    pub fn instance_offset(&self) -> u32 {
        self.is_instance() as u32
    }

    /// Declared parameter count, excluding the instance.
    pub fn param_count(&self) -> u32 {
        self.params.len() as u32
    }

    /// Parameter count including the instance.
    pub fn effective_param_count(&self) -> u32 {
        self.param_count() + self.instance_offset()
    }

    /// Whether an invocation with `argc` arguments (excluding the instance)
    /// matches this overload's parameter list.
    pub fn accepts_arg_count(&self, argc: u32) -> bool {
        if self.is_variadic() {
            argc + 1 >= self.param_count()
        } else {
            argc == self.param_count()
        }
    }

    pub fn locals(&self) -> u32 {
        match &self.body {
            MethodBody::Bytecode(b) => b.locals,
            MethodBody::Native(_) => 0,
        }
    }

    pub fn max_stack(&self) -> u32 {
        match &self.body {
            MethodBody::Bytecode(b) => b.max_stack,
            MethodBody::Native(_) => 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init.get().is_some()
    }

    pub fn initialized(&self) -> Option<&Arc<InitializedBody>> {
        self.init.get()
    }

    /// Publishes an initialized body. When another thread won the race the
    /// freshly built body is discarded; the installed one is returned either
    /// way.
    pub fn install(&self, body: InitializedBody) -> Arc<InitializedBody> {
        let _ = self.init.set(Arc::new(body));
        Arc::clone(self.init.get().unwrap())
    }

    /// Compares a call's reference signature against this overload's
    /// declared parameter list, slot by slot. `argc` excludes the instance.
    /// Returns the index of the first mismatching argument, or `None` when
    /// the signatures agree.
    pub fn verify_ref_signature(
        &self,
        signature: u32,
        argc: u32,
        pool: &RefSignaturePool,
    ) -> Option<u32> {
        for i in 0..argc {
            let passed = pool.is_param_ref(signature, i + 1);
            let declared = match self.params.get(i as usize) {
                Some(p) => p.is_ref && !p.is_variadic,
                // Surplus arguments flow into the variadic parameter and are
                // always by value.
                None => false,
            };
            if passed != declared {
                return Some(i);
            }
        }
        None
    }
}

/// A named method group with one or more overloads.
#[derive(Debug)]
pub struct Method {
    pub name: Arc<str>,
    pub decl_type: Option<TypeId>,
    pub module: ModuleId,
    pub access: Access,
    pub flags: MethodFlags,
    pub overloads: Vec<Arc<MethodOverload>>,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Resolves the overload accepting `argc` arguments (excluding the
    /// instance). Exact-arity overloads win over variadic ones.
    pub fn resolve_overload(&self, argc: u32) -> Option<(u32, &Arc<MethodOverload>)> {
        let mut variadic = None;
        for (i, mo) in self.overloads.iter().enumerate() {
            if !mo.accepts_arg_count(argc) {
                continue;
            }
            if mo.is_variadic() {
                variadic.get_or_insert((i as u32, mo));
            } else {
                return Some((i as u32, mo));
            }
        }
        variadic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overload(params: Vec<Param>, variadic: bool) -> Arc<MethodOverload> {
        let mut flags = OverloadFlags::empty();
        if variadic {
            flags |= OverloadFlags::VARIADIC;
        }
        Arc::new(MethodOverload::new(
            MethodId(0),
            ModuleId(0),
            flags,
            params,
            0,
            MethodBody::Bytecode(BytecodeBody {
                code: Box::new([]),
                locals: 0,
                max_stack: 0,
                try_blocks: Vec::new(),
                debug_symbols: None,
            }),
        ))
    }

    #[test]
    fn overload_resolution_prefers_exact_arity() {
        let group = Method {
            name: Arc::from("f"),
            decl_type: None,
            module: ModuleId(0),
            access: Access::Public,
            flags: MethodFlags::STATIC,
            overloads: vec![
                overload(vec![Param::new("rest")], true),
                overload(vec![Param::new("a")], false),
            ],
        };
        let (index, mo) = group.resolve_overload(1).unwrap();
        assert_eq!(index, 1);
        assert!(!mo.is_variadic());

        let (index, mo) = group.resolve_overload(5).unwrap();
        assert_eq!(index, 0);
        assert!(mo.is_variadic());

        // The variadic overload also accepts zero arguments.
        assert!(group.resolve_overload(0).is_some());
    }

    #[test]
    fn ref_signature_verification() {
        use ovum_core::{RefSignatureBuilder, RefSignaturePool};

        let pool = RefSignaturePool::new();
        let mo = overload(vec![Param::new("a"), Param::by_ref("b")], false);

        // Matching signature: bit 2 set (argument 1 by ref).
        let mut b = RefSignatureBuilder::new(3);
        b.set_param(2, true);
        let sig = b.commit(&pool);
        assert_eq!(mo.verify_ref_signature(sig, 2, &pool), None);

        // Trivial signature mismatches at argument 1.
        assert_eq!(mo.verify_ref_signature(0, 2, &pool), Some(1));
    }

    #[test]
    fn install_is_idempotent() {
        let mo = overload(vec![], false);
        assert!(!mo.is_initialized());
        let first = mo.install(InitializedBody {
            code: Box::new([1, 2, 3, 4]),
            try_blocks: Vec::new(),
            debug_symbols: None,
            locals: 0,
            max_stack: 1,
        });
        let second = mo.install(InitializedBody {
            code: Box::new([9, 9, 9, 9]),
            try_blocks: Vec::new(),
            debug_symbols: None,
            locals: 0,
            max_stack: 1,
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&*first.code, &[1, 2, 3, 4]);
    }
}
