//! Shared test support: a small source-bytecode assembler, fixture helpers
//! for building test modules, and a decoder for the emitted instruction
//! stream.

#![allow(dead_code)]

use std::sync::Arc;

use ovum::bytecode::internal::{self as oa, InternalOp, OPCODE_SIZE};
use ovum::bytecode::opcode::Opcode;
use ovum::prelude::*;
use ovum::runtime::method::{BytecodeBody, DebugSymbols, TryBlock};
use ovum::runtime::member::{Access, Param};
use ovum::runtime::method::MethodFlags;
use ovum::runtime::builder::OverloadDef;
use ovum::runtime::type_info::Operator;

/// A pending forward branch: where the offset operand lives and where the
/// instruction ends (offsets are relative to the instruction end).
#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    operand_at: usize,
    instr_end: usize,
}

/// Assembles source bytecode.
#[derive(Debug, Default)]
pub struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm::default()
    }

    pub fn here(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn into_code(self) -> Box<[u8]> {
        self.bytes.into_boxed_slice()
    }

    fn op(&mut self, op: Opcode) -> &mut Asm {
        self.bytes.push(op.into());
        self
    }

    fn u16(&mut self, v: u16) -> &mut Asm {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Asm {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Asm {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(&mut self, v: i64) -> &mut Asm {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn nop(&mut self) -> &mut Asm {
        self.op(Opcode::Nop)
    }

    pub fn pop(&mut self) -> &mut Asm {
        self.op(Opcode::Pop)
    }

    pub fn dup(&mut self) -> &mut Asm {
        self.op(Opcode::Dup)
    }

    pub fn ret(&mut self) -> &mut Asm {
        self.op(Opcode::Ret)
    }

    pub fn retnull(&mut self) -> &mut Asm {
        self.op(Opcode::RetNull)
    }

    pub fn ldarg(&mut self, index: u16) -> &mut Asm {
        self.op(Opcode::LdArg).u16(index)
    }

    pub fn starg(&mut self, index: u16) -> &mut Asm {
        self.op(Opcode::StArg).u16(index)
    }

    pub fn ldloc(&mut self, index: u16) -> &mut Asm {
        self.op(Opcode::LdLoc).u16(index)
    }

    pub fn stloc(&mut self, index: u16) -> &mut Asm {
        self.op(Opcode::StLoc).u16(index)
    }

    pub fn ldargc(&mut self) -> &mut Asm {
        self.op(Opcode::LdArgc)
    }

    pub fn ldnull(&mut self) -> &mut Asm {
        self.op(Opcode::LdNull)
    }

    pub fn ldtrue(&mut self) -> &mut Asm {
        self.op(Opcode::LdTrue)
    }

    pub fn ldfalse(&mut self) -> &mut Asm {
        self.op(Opcode::LdFalse)
    }

    pub fn ldc_i(&mut self, value: i64) -> &mut Asm {
        self.op(Opcode::LdcI).i64(value)
    }

    pub fn ldc_u(&mut self, value: u64) -> &mut Asm {
        self.op(Opcode::LdcU);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_r(&mut self, value: f64) -> &mut Asm {
        self.op(Opcode::LdcR);
        self.bytes.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    pub fn ldstr(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdStr).u32(token.0)
    }

    pub fn ldenum(&mut self, token: Token, value: i64) -> &mut Asm {
        self.op(Opcode::LdEnum).u32(token.0).i64(value)
    }

    pub fn list(&mut self, capacity: i32) -> &mut Asm {
        self.op(Opcode::List).i32(capacity)
    }

    pub fn hash(&mut self, capacity: i32) -> &mut Asm {
        self.op(Opcode::Hash).i32(capacity)
    }

    pub fn ldsfn(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdSfn).u32(token.0)
    }

    pub fn ldtypetkn(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdTypeTkn).u32(token.0)
    }

    pub fn newobj(&mut self, token: Token, argc: u16) -> &mut Asm {
        self.op(Opcode::NewObj).u32(token.0).u16(argc)
    }

    pub fn call(&mut self, argc: u16) -> &mut Asm {
        self.op(Opcode::Call).u16(argc)
    }

    pub fn scall(&mut self, token: Token, argc: u16) -> &mut Asm {
        self.op(Opcode::SCall).u32(token.0).u16(argc)
    }

    pub fn callmem(&mut self, token: Token, argc: u16) -> &mut Asm {
        self.op(Opcode::CallMem).u32(token.0).u16(argc)
    }

    pub fn apply(&mut self) -> &mut Asm {
        self.op(Opcode::Apply)
    }

    pub fn sapply(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::SApply).u32(token.0)
    }

    pub fn ldfld(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdFld).u32(token.0)
    }

    pub fn stfld(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::StFld).u32(token.0)
    }

    pub fn ldsfld(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdSFld).u32(token.0)
    }

    pub fn stsfld(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::StSFld).u32(token.0)
    }

    pub fn ldmem(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdMem).u32(token.0)
    }

    pub fn stmem(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::StMem).u32(token.0)
    }

    pub fn ldidx(&mut self, argc: u16) -> &mut Asm {
        self.op(Opcode::LdIdx).u16(argc)
    }

    pub fn stidx(&mut self, argc: u16) -> &mut Asm {
        self.op(Opcode::StIdx).u16(argc)
    }

    pub fn lditer(&mut self) -> &mut Asm {
        self.op(Opcode::LdIter)
    }

    pub fn ldtype(&mut self) -> &mut Asm {
        self.op(Opcode::LdType)
    }

    pub fn operator(&mut self, op: Operator) -> &mut Asm {
        self.op(Opcode::Operator);
        self.bytes.push(op.into());
        self
    }

    pub fn eq(&mut self) -> &mut Asm {
        self.op(Opcode::Eq)
    }

    pub fn cmp(&mut self) -> &mut Asm {
        self.op(Opcode::Cmp)
    }

    pub fn lt(&mut self) -> &mut Asm {
        self.op(Opcode::Lt)
    }

    pub fn lte(&mut self) -> &mut Asm {
        self.op(Opcode::Lte)
    }

    pub fn gt(&mut self) -> &mut Asm {
        self.op(Opcode::Gt)
    }

    pub fn gte(&mut self) -> &mut Asm {
        self.op(Opcode::Gte)
    }

    pub fn concat(&mut self) -> &mut Asm {
        self.op(Opcode::Concat)
    }

    pub fn throw(&mut self) -> &mut Asm {
        self.op(Opcode::Throw)
    }

    pub fn rethrow(&mut self) -> &mut Asm {
        self.op(Opcode::Rethrow)
    }

    pub fn endfinally(&mut self) -> &mut Asm {
        self.op(Opcode::EndFinally)
    }

    pub fn ldlocref(&mut self, index: u16) -> &mut Asm {
        self.op(Opcode::LdLocRef).u16(index)
    }

    pub fn ldargref(&mut self, index: u16) -> &mut Asm {
        self.op(Opcode::LdArgRef).u16(index)
    }

    pub fn ldmemref(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdMemRef).u32(token.0)
    }

    pub fn ldfldref(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdFldRef).u32(token.0)
    }

    pub fn ldsfldref(&mut self, token: Token) -> &mut Asm {
        self.op(Opcode::LdSFldRef).u32(token.0)
    }

    // Branches. A forward branch emits a placeholder and returns a fixup to
    // bind at the target; a backward branch takes the target directly.

    fn jump(&mut self, op: Opcode) -> Fixup {
        self.op(op);
        let operand_at = self.bytes.len();
        self.i32(0);
        Fixup {
            operand_at,
            instr_end: self.bytes.len(),
        }
    }

    pub fn br(&mut self) -> Fixup {
        self.jump(Opcode::Br)
    }

    pub fn br_to(&mut self, target: u32) {
        let fix = self.jump(Opcode::Br);
        self.bind_at(fix, target);
    }

    pub fn leave(&mut self) -> Fixup {
        self.jump(Opcode::Leave)
    }

    pub fn brnull(&mut self) -> Fixup {
        self.jump(Opcode::BrNull)
    }

    pub fn brinst(&mut self) -> Fixup {
        self.jump(Opcode::BrInst)
    }

    pub fn brfalse(&mut self) -> Fixup {
        self.jump(Opcode::BrFalse)
    }

    pub fn brfalse_to(&mut self, target: u32) {
        let fix = self.jump(Opcode::BrFalse);
        self.bind_at(fix, target);
    }

    pub fn brtrue(&mut self) -> Fixup {
        self.jump(Opcode::BrTrue)
    }

    pub fn brtrue_to(&mut self, target: u32) {
        let fix = self.jump(Opcode::BrTrue);
        self.bind_at(fix, target);
    }

    pub fn brref(&mut self) -> Fixup {
        self.jump(Opcode::BrRef)
    }

    pub fn brnref(&mut self) -> Fixup {
        self.jump(Opcode::BrNRef)
    }

    pub fn brtype(&mut self, token: Token) -> Fixup {
        self.op(Opcode::BrType).u32(token.0);
        let operand_at = self.bytes.len();
        self.i32(0);
        Fixup {
            operand_at,
            instr_end: self.bytes.len(),
        }
    }

    /// Emits a switch with `count` placeholder targets.
    pub fn switch(&mut self, count: u16) -> Vec<Fixup> {
        self.op(Opcode::Switch).u16(count);
        let mut fixups = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let operand_at = self.bytes.len();
            self.i32(0);
            fixups.push(Fixup {
                operand_at,
                instr_end: 0,
            });
        }
        let end = self.bytes.len();
        for fix in &mut fixups {
            fix.instr_end = end;
        }
        fixups
    }

    /// Binds a fixup to the current position.
    pub fn bind(&mut self, fix: Fixup) {
        let target = self.here();
        self.bind_at(fix, target);
    }

    pub fn bind_at(&mut self, fix: Fixup, target: u32) {
        let rel = target as i64 - fix.instr_end as i64;
        self.bytes[fix.operand_at..fix.operand_at + 4]
            .copy_from_slice(&(rel as i32).to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn body(code: Asm, locals: u32, max_stack: u32) -> BytecodeBody {
    BytecodeBody {
        code: code.into_code(),
        locals,
        max_stack,
        try_blocks: Vec::new(),
        debug_symbols: None,
    }
}

pub fn body_with(
    code: Asm,
    locals: u32,
    max_stack: u32,
    try_blocks: Vec<TryBlock>,
    debug_symbols: Option<DebugSymbols>,
) -> BytecodeBody {
    BytecodeBody {
        code: code.into_code(),
        locals,
        max_stack,
        try_blocks,
        debug_symbols,
    }
}

/// Registers a global (static, module-level) bytecode function.
pub fn add_global_fn(
    builder: &mut VmBuilder,
    name: &str,
    params: Vec<Param>,
    body: BytecodeBody,
) -> (MethodId, Token) {
    builder.add_method(
        None,
        name,
        Access::Public,
        MethodFlags::STATIC,
        false,
        vec![OverloadDef::bytecode(false, params, body)],
    )
}

/// Runs a method group with the given arguments on a fresh thread.
pub fn run_method(
    vm: &Arc<Vm>,
    method: MethodId,
    args: Vec<Value>,
) -> (Thread, Result<Value, Abort>) {
    let group = vm.method(method);
    let (_, overload) = group
        .resolve_overload(args.len() as u32)
        .expect("no overload for argument count");
    let overload = Arc::clone(overload);
    let mut thread = Thread::new(Arc::clone(vm));
    let result = thread.start(&overload, args);
    (thread, result)
}

/// Builds (parses, analyzes, emits) a method without running it.
pub fn build_method(
    vm: &Arc<Vm>,
    method: MethodId,
) -> Result<ovum::runtime::method::InitializedBody, MethodInitError> {
    let overload = Arc::clone(&vm.method(method).overloads[0]);
    ovum::method::MethodInitializer::new(vm)
        .build(&overload)
        .map(|(body, _)| body)
}

// ---------------------------------------------------------------------------
// Emitted-stream decoding
// ---------------------------------------------------------------------------

/// One decoded instruction of the emitted stream.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub offset: usize,
    pub op: InternalOp,
    pub size: usize,
    /// Absolute byte offsets of branch/switch targets.
    pub targets: Vec<usize>,
}

/// Walks the emitted stream instruction by instruction.
pub fn decode(code: &[u8]) -> Vec<Decoded> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let op = InternalOp::try_from(code[offset]).expect("bad opcode in emitted stream");
        let args = offset + OPCODE_SIZE;
        let read_i32 = |at: usize| i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
        let read_u32 = |at: usize| u32::from_le_bytes(code[at..at + 4].try_into().unwrap());

        let (args_size, targets): (usize, Vec<usize>) = match op {
            InternalOp::Nop
            | InternalOp::Pop
            | InternalOp::Ret
            | InternalOp::RetNull
            | InternalOp::Throw
            | InternalOp::Rethrow
            | InternalOp::EndFinally => (0, vec![]),

            InternalOp::MvlocLL
            | InternalOp::MvlocSL
            | InternalOp::MvlocLS
            | InternalOp::MvlocSS
            | InternalOp::MvlocRL
            | InternalOp::MvlocRS
            | InternalOp::MvlocLR
            | InternalOp::MvlocSR
            | InternalOp::LdIterL
            | InternalOp::LdIterS
            | InternalOp::LdTypeL
            | InternalOp::LdTypeS
            | InternalOp::ApplyL
            | InternalOp::ApplyS
            | InternalOp::EqL
            | InternalOp::EqS
            | InternalOp::CmpL
            | InternalOp::CmpS
            | InternalOp::LtL
            | InternalOp::LtS
            | InternalOp::GtL
            | InternalOp::GtS
            | InternalOp::LteL
            | InternalOp::LteS
            | InternalOp::GteL
            | InternalOp::GteS
            | InternalOp::ConcatL
            | InternalOp::ConcatS => (oa::TWO_LOCALS_SIZE, vec![]),

            InternalOp::LdNullL
            | InternalOp::LdNullS
            | InternalOp::LdFalseL
            | InternalOp::LdFalseS
            | InternalOp::LdTrueL
            | InternalOp::LdTrueS
            | InternalOp::LdArgcL
            | InternalOp::LdArgcS
            | InternalOp::LdLocRef => (oa::ONE_LOCAL_SIZE, vec![]),

            InternalOp::LdcIL | InternalOp::LdcIS | InternalOp::LdcUL | InternalOp::LdcUS
            | InternalOp::LdcRL | InternalOp::LdcRS => (oa::LOCAL_AND_VALUE64_SIZE, vec![]),

            InternalOp::LdStrL
            | InternalOp::LdStrS
            | InternalOp::ListL
            | InternalOp::ListS
            | InternalOp::HashL
            | InternalOp::HashS
            | InternalOp::LdSfnL
            | InternalOp::LdSfnS
            | InternalOp::LdTypeTknL
            | InternalOp::LdTypeTknS
            | InternalOp::LdSFldL
            | InternalOp::LdSFldS
            | InternalOp::StSFldL
            | InternalOp::StSFldS
            | InternalOp::StFld
            | InternalOp::StFldFast
            | InternalOp::StMem
            | InternalOp::StIdx
            | InternalOp::LdMemRefL
            | InternalOp::LdMemRefS
            | InternalOp::LdFldRefL
            | InternalOp::LdFldRefS => (oa::LOCAL_AND_ID_SIZE, vec![]),

            InternalOp::LdEnumL | InternalOp::LdEnumS => (oa::LOAD_ENUM_SIZE, vec![]),
            InternalOp::NewObjL | InternalOp::NewObjS => (oa::NEW_OBJECT_SIZE, vec![]),

            InternalOp::LdFldL
            | InternalOp::LdFldS
            | InternalOp::LdFldFastL
            | InternalOp::LdFldFastS
            | InternalOp::LdMemL
            | InternalOp::LdMemS
            | InternalOp::LdIdxL
            | InternalOp::LdIdxS => (oa::TWO_LOCALS_AND_ID_SIZE, vec![]),

            InternalOp::CallL | InternalOp::CallS => (oa::CALL_SIZE, vec![]),
            InternalOp::CallRL | InternalOp::CallRS => (oa::CALL_REF_SIZE, vec![]),
            InternalOp::CallMemL | InternalOp::CallMemS => (oa::CALL_MEMBER_SIZE, vec![]),
            InternalOp::CallMemRL | InternalOp::CallMemRS => {
                (oa::CALL_MEMBER_REF_SIZE, vec![])
            }
            InternalOp::ScallL | InternalOp::ScallS => (oa::STATIC_CALL_SIZE, vec![]),
            InternalOp::SapplyL | InternalOp::SapplyS => (oa::STATIC_APPLY_SIZE, vec![]),

            InternalOp::LdSFldRef => (oa::SINGLE_ID_SIZE, vec![]),
            InternalOp::OperatorL
            | InternalOp::OperatorS
            | InternalOp::UnaryOpL
            | InternalOp::UnaryOpS => (oa::OPERATOR_SIZE, vec![]),

            InternalOp::Br | InternalOp::Leave => {
                let end = args + oa::BRANCH_SIZE;
                let target = (end as i64 + read_i32(args) as i64) as usize;
                (oa::BRANCH_SIZE, vec![target])
            }
            InternalOp::BrNullL
            | InternalOp::BrNullS
            | InternalOp::BrInstL
            | InternalOp::BrInstS
            | InternalOp::BrFalseL
            | InternalOp::BrFalseS
            | InternalOp::BrTrueL
            | InternalOp::BrTrueS
            | InternalOp::BrRef
            | InternalOp::BrNRef
            | InternalOp::BrEq
            | InternalOp::BrNeq
            | InternalOp::BrLt
            | InternalOp::BrGt
            | InternalOp::BrLte
            | InternalOp::BrGte => {
                let end = args + oa::COND_BRANCH_SIZE;
                let target = (end as i64 + read_i32(args + 4) as i64) as usize;
                (oa::COND_BRANCH_SIZE, vec![target])
            }
            InternalOp::BrTypeL | InternalOp::BrTypeS => {
                let end = args + oa::BRANCH_IF_TYPE_SIZE;
                let target = (end as i64 + read_i32(args + 4) as i64) as usize;
                (oa::BRANCH_IF_TYPE_SIZE, vec![target])
            }
            InternalOp::SwitchL | InternalOp::SwitchS => {
                let count = read_u32(args + 4) as usize;
                let size = oa::switch_size(count);
                let end = args + size;
                let targets = (0..count)
                    .map(|i| (end as i64 + read_i32(args + 8 + 4 * i) as i64) as usize)
                    .collect();
                (size, targets)
            }
        };

        let size = OPCODE_SIZE + args_size;
        out.push(Decoded {
            offset,
            op,
            size,
            targets,
        });
        offset += size;
    }
    out
}

/// The opcode sequence of an emitted stream.
pub fn opcodes(code: &[u8]) -> Vec<InternalOp> {
    decode(code).into_iter().map(|d| d.op).collect()
}
