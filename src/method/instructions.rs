//! Intermediate instructions.
//!
//! The builder-time representation of one executable step. Each instruction
//! carries its internal opcode, a flag set describing how the analyzer may
//! treat it, and an operand record. The analyzer folds storage locations
//! into the operands through [`Instruction::update_input`] and
//! [`Instruction::update_output`], which also flip the opcode's stack bits;
//! on emission the instruction serializes itself into a [`MethodBuffer`].
//!
//! Branch and switch targets go through three meanings over an
//! instruction's life: absolute source byte offsets while parsing, builder
//! instruction indices during analysis, and signed relative byte offsets in
//! the emitted stream.

use bitflags::bitflags;

use ovum_core::{FieldId, MethodId, StrId, TypeId};

use crate::bytecode::internal::{self as oa, InternalOp, LocalOffset};
use crate::method::buffer::MethodBuffer;
use crate::runtime::type_info::Operator;

bitflags! {
    /// Analyzer-facing properties of an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstrFlags: u16 {
        /// Another instruction branches here.
        const HAS_INCOMING_BRANCHES = 0x0001;
        /// The instruction has a LocalOffset input.
        const HAS_INPUT = 0x0002;
        /// The instruction has a LocalOffset output.
        const HAS_OUTPUT = 0x0004;
        /// The input must stay on the evaluation stack. Without this flag a
        /// preceding plain load can be folded into the input.
        const INPUT_ON_STACK = 0x0008;
        const BRANCH = 0x0010;
        const SWITCH = 0x0020;
        /// A plain local/argument load (foldable).
        const LOAD_LOCAL = 0x0040;
        /// A plain local/argument store (foldable).
        const STORE_LOCAL = 0x0080;
        const DUP = 0x0100;
        /// The instruction accepts references among its stack arguments.
        const ACCEPTS_REFS = 0x0200;
        /// The instruction pushes a reference onto the stack.
        const PUSHES_REF = 0x0400;
    }
}

/// How many values an instruction pops and pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackChange {
    pub removed: u16,
    pub added: u16,
}

impl StackChange {
    pub const EMPTY: StackChange = StackChange {
        removed: 0,
        added: 0,
    };

    pub fn new(removed: u16, added: u16) -> StackChange {
        StackChange { removed, added }
    }
}

/// The role of a `mvloc`-family instruction, which decides its declared
/// stack change during analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveRole {
    /// A generic move; the change follows the opcode bits.
    Plain,
    /// Pushes a local/argument (or dereferences a ref-cell argument).
    Load,
    /// Pops into a local/argument (or writes through a ref-cell argument).
    Store,
}

/// Constant payload of a value-producing instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadConst {
    Null,
    True,
    False,
    ArgCount,
    Int(i64),
    UInt(u64),
    Real(f64),
    Str(StrId),
    Enum(TypeId, i64),
    ListCap(i32),
    HashCap(i32),
    StaticFunc(MethodId),
    TypeToken(TypeId),
    StaticField(FieldId),
}

/// Operand record of an intermediate instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    Simple,
    Move {
        source: LocalOffset,
        target: LocalOffset,
        role: MoveRole,
    },
    Dup {
        source: LocalOffset,
        target: LocalOffset,
    },
    LoadValue {
        target: LocalOffset,
        constant: LoadConst,
    },
    StoreStaticField {
        value: LocalOffset,
        field: FieldId,
    },
    LoadField {
        instance: LocalOffset,
        output: LocalOffset,
        field: FieldId,
    },
    StoreField {
        args: LocalOffset,
        field: FieldId,
    },
    LoadMember {
        instance: LocalOffset,
        output: LocalOffset,
        member: StrId,
    },
    StoreMember {
        args: LocalOffset,
        member: StrId,
    },
    LoadIterator {
        value: LocalOffset,
        output: LocalOffset,
    },
    LoadTypeOf {
        source: LocalOffset,
        target: LocalOffset,
    },
    LoadIndexer {
        args: LocalOffset,
        output: LocalOffset,
        arg_count: u32,
    },
    StoreIndexer {
        args: LocalOffset,
        arg_count: u32,
    },
    NewObject {
        args: LocalOffset,
        target: LocalOffset,
        type_id: TypeId,
        arg_count: u32,
        ref_signature: u32,
    },
    Call {
        args: LocalOffset,
        output: LocalOffset,
        arg_count: u32,
        ref_signature: u32,
    },
    CallMember {
        args: LocalOffset,
        output: LocalOffset,
        member: StrId,
        arg_count: u32,
        ref_signature: u32,
    },
    StaticCall {
        args: LocalOffset,
        output: LocalOffset,
        arg_count: u32,
        method: MethodId,
        overload: u32,
        pops_instance: bool,
        ref_signature: u32,
    },
    Apply {
        args: LocalOffset,
        output: LocalOffset,
    },
    StaticApply {
        args: LocalOffset,
        output: LocalOffset,
        method: MethodId,
    },
    Branch {
        target: usize,
    },
    CondBranch {
        value: LocalOffset,
        target: usize,
    },
    BranchIfType {
        value: LocalOffset,
        target: usize,
        type_id: TypeId,
    },
    BranchRef {
        args: LocalOffset,
        target: usize,
    },
    BranchComparison {
        args: LocalOffset,
        target: usize,
    },
    Switch {
        value: LocalOffset,
        targets: Vec<usize>,
    },
    Operator {
        args: LocalOffset,
        output: LocalOffset,
        op: Operator,
    },
    /// `eq`, `cmp`, `lt`, `gt`, `lte`, `gte` and `concat`; the operation is
    /// the opcode.
    CompareOp {
        args: LocalOffset,
        output: LocalOffset,
    },
    LoadLocalRef {
        local: LocalOffset,
    },
    LoadMemberRef {
        instance: LocalOffset,
        member: StrId,
    },
    LoadFieldRef {
        instance: LocalOffset,
        field: FieldId,
    },
    LoadStaticFieldRef {
        field: FieldId,
    },
}

/// Condition selector for the plain conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCondition {
    IfNull,
    NotNull,
    IfFalse,
    IfTrue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: InternalOp,
    pub flags: InstrFlags,
    pub kind: InstrKind,
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl Instruction {
    fn new(opcode: InternalOp, flags: InstrFlags, kind: InstrKind) -> Instruction {
        Instruction {
            opcode,
            flags,
            kind,
        }
    }

    pub fn nop() -> Instruction {
        Instruction::new(InternalOp::Nop, InstrFlags::empty(), InstrKind::Simple)
    }

    pub fn pop() -> Instruction {
        Instruction::new(InternalOp::Pop, InstrFlags::empty(), InstrKind::Simple)
    }

    pub fn ret() -> Instruction {
        Instruction::new(InternalOp::Ret, InstrFlags::empty(), InstrKind::Simple)
    }

    pub fn ret_null() -> Instruction {
        Instruction::new(InternalOp::RetNull, InstrFlags::empty(), InstrKind::Simple)
    }

    pub fn throw() -> Instruction {
        Instruction::new(InternalOp::Throw, InstrFlags::empty(), InstrKind::Simple)
    }

    pub fn rethrow() -> Instruction {
        Instruction::new(InternalOp::Rethrow, InstrFlags::empty(), InstrKind::Simple)
    }

    pub fn end_finally() -> Instruction {
        Instruction::new(
            InternalOp::EndFinally,
            InstrFlags::empty(),
            InstrKind::Simple,
        )
    }

    /// Loads a local or argument onto the stack. When `source_is_ref`, the
    /// named slot holds a reference cell (a by-ref parameter) that is read
    /// through, and the instruction is not foldable.
    pub fn load_local(source: LocalOffset, source_is_ref: bool) -> Instruction {
        if source_is_ref {
            Instruction::new(
                InternalOp::MvlocRS,
                InstrFlags::HAS_OUTPUT,
                InstrKind::Move {
                    source,
                    target: LocalOffset::default(),
                    role: MoveRole::Load,
                },
            )
        } else {
            Instruction::new(
                InternalOp::MvlocLS,
                InstrFlags::HAS_OUTPUT | InstrFlags::LOAD_LOCAL,
                InstrKind::Move {
                    source,
                    target: LocalOffset::default(),
                    role: MoveRole::Load,
                },
            )
        }
    }

    /// Stores the top of the stack into a local or argument. When
    /// `target_is_ref`, the named slot holds a reference cell that is
    /// written through.
    pub fn store_local(target: LocalOffset, target_is_ref: bool) -> Instruction {
        if target_is_ref {
            Instruction::new(
                InternalOp::MvlocSR,
                InstrFlags::HAS_INPUT,
                InstrKind::Move {
                    source: LocalOffset::default(),
                    target,
                    role: MoveRole::Store,
                },
            )
        } else {
            Instruction::new(
                InternalOp::MvlocSL,
                InstrFlags::HAS_INPUT | InstrFlags::STORE_LOCAL,
                InstrKind::Move {
                    source: LocalOffset::default(),
                    target,
                    role: MoveRole::Store,
                },
            )
        }
    }

    pub fn dup() -> Instruction {
        Instruction::new(
            InternalOp::MvlocLS,
            InstrFlags::HAS_INPUT
                | InstrFlags::HAS_OUTPUT
                | InstrFlags::INPUT_ON_STACK
                | InstrFlags::DUP,
            InstrKind::Dup {
                source: LocalOffset::default(),
                target: LocalOffset::default(),
            },
        )
    }

    fn load_value(opcode: InternalOp, constant: LoadConst) -> Instruction {
        Instruction::new(
            opcode,
            InstrFlags::HAS_OUTPUT,
            InstrKind::LoadValue {
                target: LocalOffset::default(),
                constant,
            },
        )
    }

    pub fn load_null() -> Instruction {
        Instruction::load_value(InternalOp::LdNullS, LoadConst::Null)
    }

    pub fn load_bool(value: bool) -> Instruction {
        if value {
            Instruction::load_value(InternalOp::LdTrueS, LoadConst::True)
        } else {
            Instruction::load_value(InternalOp::LdFalseS, LoadConst::False)
        }
    }

    pub fn load_int(value: i64) -> Instruction {
        Instruction::load_value(InternalOp::LdcIS, LoadConst::Int(value))
    }

    pub fn load_uint(value: u64) -> Instruction {
        Instruction::load_value(InternalOp::LdcUS, LoadConst::UInt(value))
    }

    pub fn load_real(value: f64) -> Instruction {
        Instruction::load_value(InternalOp::LdcRS, LoadConst::Real(value))
    }

    pub fn load_string(value: StrId) -> Instruction {
        Instruction::load_value(InternalOp::LdStrS, LoadConst::Str(value))
    }

    pub fn load_argc() -> Instruction {
        Instruction::load_value(InternalOp::LdArgcS, LoadConst::ArgCount)
    }

    pub fn load_enum(type_id: TypeId, value: i64) -> Instruction {
        Instruction::load_value(InternalOp::LdEnumS, LoadConst::Enum(type_id, value))
    }

    pub fn create_list(capacity: i32) -> Instruction {
        Instruction::load_value(InternalOp::ListS, LoadConst::ListCap(capacity))
    }

    pub fn create_hash(capacity: i32) -> Instruction {
        Instruction::load_value(InternalOp::HashS, LoadConst::HashCap(capacity))
    }

    pub fn load_static_function(method: MethodId) -> Instruction {
        Instruction::load_value(InternalOp::LdSfnS, LoadConst::StaticFunc(method))
    }

    pub fn load_type_token(type_id: TypeId) -> Instruction {
        Instruction::load_value(InternalOp::LdTypeTknS, LoadConst::TypeToken(type_id))
    }

    pub fn load_static_field(field: FieldId) -> Instruction {
        Instruction::load_value(InternalOp::LdSFldS, LoadConst::StaticField(field))
    }

    pub fn store_static_field(field: FieldId) -> Instruction {
        Instruction::new(
            InternalOp::StSFldS,
            InstrFlags::HAS_INPUT,
            InstrKind::StoreStaticField {
                value: LocalOffset::default(),
                field,
            },
        )
    }

    pub fn load_field(field: FieldId, fast: bool) -> Instruction {
        let opcode = if fast {
            InternalOp::LdFldFastS
        } else {
            InternalOp::LdFldS
        };
        Instruction::new(
            opcode,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::LoadField {
                instance: LocalOffset::default(),
                output: LocalOffset::default(),
                field,
            },
        )
    }

    pub fn store_field(field: FieldId, fast: bool) -> Instruction {
        let opcode = if fast {
            InternalOp::StFldFast
        } else {
            InternalOp::StFld
        };
        Instruction::new(
            opcode,
            InstrFlags::HAS_INPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::StoreField {
                args: LocalOffset::default(),
                field,
            },
        )
    }

    pub fn load_member(member: StrId) -> Instruction {
        Instruction::new(
            InternalOp::LdMemS,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::LoadMember {
                instance: LocalOffset::default(),
                output: LocalOffset::default(),
                member,
            },
        )
    }

    pub fn store_member(member: StrId) -> Instruction {
        Instruction::new(
            InternalOp::StMem,
            InstrFlags::HAS_INPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::StoreMember {
                args: LocalOffset::default(),
                member,
            },
        )
    }

    pub fn load_iterator() -> Instruction {
        Instruction::new(
            InternalOp::LdIterS,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::LoadIterator {
                value: LocalOffset::default(),
                output: LocalOffset::default(),
            },
        )
    }

    pub fn load_type_of() -> Instruction {
        Instruction::new(
            InternalOp::LdTypeS,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::LoadTypeOf {
                source: LocalOffset::default(),
                target: LocalOffset::default(),
            },
        )
    }

    pub fn load_indexer(arg_count: u32) -> Instruction {
        Instruction::new(
            InternalOp::LdIdxS,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::LoadIndexer {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
                arg_count,
            },
        )
    }

    pub fn store_indexer(arg_count: u32) -> Instruction {
        Instruction::new(
            InternalOp::StIdx,
            InstrFlags::HAS_INPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::StoreIndexer {
                args: LocalOffset::default(),
                arg_count,
            },
        )
    }

    pub fn new_object(type_id: TypeId, arg_count: u32) -> Instruction {
        Instruction::new(
            InternalOp::NewObjS,
            InstrFlags::HAS_INPUT
                | InstrFlags::HAS_OUTPUT
                | InstrFlags::INPUT_ON_STACK
                | InstrFlags::ACCEPTS_REFS,
            InstrKind::NewObject {
                args: LocalOffset::default(),
                target: LocalOffset::default(),
                type_id,
                arg_count,
                ref_signature: 0,
            },
        )
    }

    pub fn call(arg_count: u32) -> Instruction {
        Instruction::new(
            InternalOp::CallS,
            InstrFlags::HAS_INPUT
                | InstrFlags::HAS_OUTPUT
                | InstrFlags::INPUT_ON_STACK
                | InstrFlags::ACCEPTS_REFS,
            InstrKind::Call {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
                arg_count,
                ref_signature: 0,
            },
        )
    }

    pub fn call_member(member: StrId, arg_count: u32) -> Instruction {
        Instruction::new(
            InternalOp::CallMemS,
            InstrFlags::HAS_INPUT
                | InstrFlags::HAS_OUTPUT
                | InstrFlags::INPUT_ON_STACK
                | InstrFlags::ACCEPTS_REFS,
            InstrKind::CallMember {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
                member,
                arg_count,
                ref_signature: 0,
            },
        )
    }

    pub fn static_call(
        arg_count: u32,
        method: MethodId,
        overload: u32,
        pops_instance: bool,
    ) -> Instruction {
        Instruction::new(
            InternalOp::ScallS,
            InstrFlags::HAS_INPUT
                | InstrFlags::HAS_OUTPUT
                | InstrFlags::INPUT_ON_STACK
                | InstrFlags::ACCEPTS_REFS,
            InstrKind::StaticCall {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
                arg_count,
                method,
                overload,
                pops_instance,
                ref_signature: 0,
            },
        )
    }

    pub fn apply() -> Instruction {
        Instruction::new(
            InternalOp::ApplyS,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::Apply {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
            },
        )
    }

    pub fn static_apply(method: MethodId) -> Instruction {
        Instruction::new(
            InternalOp::SapplyS,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::StaticApply {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
                method,
            },
        )
    }

    /// `br` or, when `is_leave`, a `leave` that unwinds through enclosing
    /// finally clauses.
    pub fn branch(target: usize, is_leave: bool) -> Instruction {
        let opcode = if is_leave {
            InternalOp::Leave
        } else {
            InternalOp::Br
        };
        Instruction::new(opcode, InstrFlags::BRANCH, InstrKind::Branch { target })
    }

    pub fn cond_branch(target: usize, condition: BranchCondition) -> Instruction {
        let opcode = match condition {
            BranchCondition::IfNull => InternalOp::BrNullS,
            BranchCondition::NotNull => InternalOp::BrInstS,
            BranchCondition::IfFalse => InternalOp::BrFalseS,
            BranchCondition::IfTrue => InternalOp::BrTrueS,
        };
        Instruction::new(
            opcode,
            InstrFlags::BRANCH | InstrFlags::HAS_INPUT,
            InstrKind::CondBranch {
                value: LocalOffset::default(),
                target,
            },
        )
    }

    pub fn branch_if_type(target: usize, type_id: TypeId) -> Instruction {
        Instruction::new(
            InternalOp::BrTypeS,
            InstrFlags::BRANCH | InstrFlags::HAS_INPUT,
            InstrKind::BranchIfType {
                value: LocalOffset::default(),
                target,
                type_id,
            },
        )
    }

    pub fn branch_ref(target: usize, branch_if_same: bool) -> Instruction {
        let opcode = if branch_if_same {
            InternalOp::BrRef
        } else {
            InternalOp::BrNRef
        };
        Instruction::new(
            opcode,
            InstrFlags::BRANCH | InstrFlags::HAS_INPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::BranchRef {
                args: LocalOffset::default(),
                target,
            },
        )
    }

    /// A fused compare-and-branch, produced by the peephole pass.
    pub fn branch_comparison(args: LocalOffset, target: usize, opcode: InternalOp) -> Instruction {
        Instruction::new(
            opcode,
            InstrFlags::BRANCH | InstrFlags::HAS_INPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::BranchComparison { args, target },
        )
    }

    pub fn switch(targets: Vec<usize>) -> Instruction {
        Instruction::new(
            InternalOp::SwitchS,
            InstrFlags::SWITCH | InstrFlags::HAS_INPUT,
            InstrKind::Switch {
                value: LocalOffset::default(),
                targets,
            },
        )
    }

    pub fn operator(op: Operator) -> Instruction {
        let opcode = match op.arity() {
            1 => InternalOp::UnaryOpS,
            _ => InternalOp::OperatorS,
        };
        Instruction::new(
            opcode,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::Operator {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
                op,
            },
        )
    }

    /// One of the dedicated comparison/concat opcodes (`EqS`, `CmpS`, `LtS`,
    /// `GtS`, `LteS`, `GteS`, `ConcatS`).
    pub fn compare_op(opcode: InternalOp) -> Instruction {
        Instruction::new(
            opcode,
            InstrFlags::HAS_INPUT | InstrFlags::HAS_OUTPUT | InstrFlags::INPUT_ON_STACK,
            InstrKind::CompareOp {
                args: LocalOffset::default(),
                output: LocalOffset::default(),
            },
        )
    }

    pub fn load_local_ref(local: LocalOffset) -> Instruction {
        Instruction::new(
            InternalOp::LdLocRef,
            InstrFlags::PUSHES_REF,
            InstrKind::LoadLocalRef { local },
        )
    }

    pub fn load_member_ref(member: StrId) -> Instruction {
        Instruction::new(
            InternalOp::LdMemRefS,
            InstrFlags::HAS_INPUT | InstrFlags::PUSHES_REF,
            InstrKind::LoadMemberRef {
                instance: LocalOffset::default(),
                member,
            },
        )
    }

    pub fn load_field_ref(field: FieldId) -> Instruction {
        Instruction::new(
            InternalOp::LdFldRefS,
            InstrFlags::HAS_INPUT | InstrFlags::PUSHES_REF,
            InstrKind::LoadFieldRef {
                instance: LocalOffset::default(),
                field,
            },
        )
    }

    pub fn load_static_field_ref(field: FieldId) -> Instruction {
        Instruction::new(
            InternalOp::LdSFldRef,
            InstrFlags::PUSHES_REF,
            InstrKind::LoadStaticFieldRef { field },
        )
    }
}

// ---------------------------------------------------------------------------
// Flag queries
// ---------------------------------------------------------------------------

impl Instruction {
    pub fn has_input(&self) -> bool {
        self.flags.contains(InstrFlags::HAS_INPUT)
    }

    pub fn has_output(&self) -> bool {
        self.flags.contains(InstrFlags::HAS_OUTPUT)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(InstrFlags::BRANCH)
    }

    pub fn is_switch(&self) -> bool {
        self.flags.contains(InstrFlags::SWITCH)
    }

    pub fn is_load_local(&self) -> bool {
        self.flags.contains(InstrFlags::LOAD_LOCAL)
    }

    pub fn is_store_local(&self) -> bool {
        self.flags.contains(InstrFlags::STORE_LOCAL)
    }

    pub fn is_dup(&self) -> bool {
        self.flags.contains(InstrFlags::DUP)
    }

    pub fn has_incoming_branches(&self) -> bool {
        self.flags.contains(InstrFlags::HAS_INCOMING_BRANCHES)
    }

    pub fn requires_stack_input(&self) -> bool {
        self.flags.contains(InstrFlags::INPUT_ON_STACK)
    }

    pub fn accepts_refs(&self) -> bool {
        self.flags.contains(InstrFlags::ACCEPTS_REFS)
    }

    pub fn pushes_ref(&self) -> bool {
        self.flags.contains(InstrFlags::PUSHES_REF)
    }

    pub fn add_incoming_branch(&mut self) {
        self.flags |= InstrFlags::HAS_INCOMING_BRANCHES;
    }

    /// Whether a branch is conditional: its fall-through stays reachable.
    pub fn is_conditional(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::CondBranch { .. }
                | InstrKind::BranchIfType { .. }
                | InstrKind::BranchRef { .. }
                | InstrKind::BranchComparison { .. }
        )
    }

    /// The source of a foldable load.
    pub fn load_source(&self) -> Option<LocalOffset> {
        match self.kind {
            InstrKind::Move {
                source,
                role: MoveRole::Load,
                ..
            } if self.is_load_local() => Some(source),
            _ => None,
        }
    }

    /// The target of a foldable store.
    pub fn store_target(&self) -> Option<LocalOffset> {
        match self.kind {
            InstrKind::Move {
                target,
                role: MoveRole::Store,
                ..
            } if self.is_store_local() => Some(target),
            _ => None,
        }
    }

    pub fn branch_target(&self) -> Option<usize> {
        match &self.kind {
            InstrKind::Branch { target }
            | InstrKind::CondBranch { target, .. }
            | InstrKind::BranchIfType { target, .. }
            | InstrKind::BranchRef { target, .. }
            | InstrKind::BranchComparison { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn branch_target_mut(&mut self) -> Option<&mut usize> {
        match &mut self.kind {
            InstrKind::Branch { target }
            | InstrKind::CondBranch { target, .. }
            | InstrKind::BranchIfType { target, .. }
            | InstrKind::BranchRef { target, .. }
            | InstrKind::BranchComparison { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn switch_targets(&self) -> Option<&[usize]> {
        match &self.kind {
            InstrKind::Switch { targets, .. } => Some(targets),
            _ => None,
        }
    }

    pub fn switch_targets_mut(&mut self) -> Option<&mut Vec<usize>> {
        match &mut self.kind {
            InstrKind::Switch { targets, .. } => Some(targets),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stack change, sizes, operand updates
// ---------------------------------------------------------------------------

impl Instruction {
    fn low_bit(&self) -> u16 {
        self.opcode.low_bit() as u16
    }

    pub fn stack_change(&self) -> StackChange {
        match &self.kind {
            InstrKind::Simple => match self.opcode {
                InternalOp::Pop | InternalOp::Ret | InternalOp::Throw => StackChange::new(1, 0),
                _ => StackChange::EMPTY,
            },
            InstrKind::Move { role, .. } => match role {
                MoveRole::Load => StackChange::new(0, 1),
                MoveRole::Store => StackChange::new(1, 0),
                MoveRole::Plain => {
                    let raw = u8::from(self.opcode);
                    StackChange::new((raw & 1) as u16, ((raw >> 1) & 1) as u16)
                }
            },
            InstrKind::Dup { .. } => {
                // Claims to add two values; the second is redirected to a
                // local when a store is folded in.
                if self.opcode == InternalOp::MvlocLS {
                    StackChange::new(1, 2)
                } else {
                    StackChange::new(1, 1)
                }
            }
            InstrKind::LoadValue { .. } => StackChange::new(0, self.low_bit()),
            InstrKind::StoreStaticField { .. } => StackChange::new(self.low_bit(), 0),
            InstrKind::LoadField { .. }
            | InstrKind::LoadMember { .. }
            | InstrKind::LoadIterator { .. }
            | InstrKind::LoadTypeOf { .. } => StackChange::new(1, self.low_bit()),
            InstrKind::StoreField { .. } | InstrKind::StoreMember { .. } => StackChange::new(2, 0),
            InstrKind::LoadIndexer { arg_count, .. } => {
                StackChange::new(*arg_count as u16 + 1, self.low_bit())
            }
            InstrKind::StoreIndexer { arg_count, .. } => {
                StackChange::new(*arg_count as u16 + 2, 0)
            }
            InstrKind::NewObject { arg_count, .. } => {
                StackChange::new(*arg_count as u16, self.low_bit())
            }
            InstrKind::Call { arg_count, .. } | InstrKind::CallMember { arg_count, .. } => {
                StackChange::new(*arg_count as u16 + 1, self.low_bit())
            }
            InstrKind::StaticCall {
                arg_count,
                pops_instance,
                ..
            } => StackChange::new(*arg_count as u16 + *pops_instance as u16, self.low_bit()),
            InstrKind::Apply { .. } => StackChange::new(2, self.low_bit()),
            InstrKind::StaticApply { .. } => StackChange::new(1, self.low_bit()),
            InstrKind::Branch { .. } => StackChange::EMPTY,
            InstrKind::CondBranch { .. } | InstrKind::BranchIfType { .. } => {
                StackChange::new(self.low_bit(), 0)
            }
            InstrKind::BranchRef { .. } | InstrKind::BranchComparison { .. } => {
                StackChange::new(2, 0)
            }
            InstrKind::Switch { .. } => StackChange::new(self.low_bit(), 0),
            InstrKind::Operator { op, .. } => StackChange::new(op.arity() as u16, self.low_bit()),
            InstrKind::CompareOp { .. } => StackChange::new(2, self.low_bit()),
            InstrKind::LoadLocalRef { .. } | InstrKind::LoadStaticFieldRef { .. } => {
                StackChange::new(0, 1)
            }
            InstrKind::LoadMemberRef { .. } | InstrKind::LoadFieldRef { .. } => {
                StackChange::new(1, 1)
            }
        }
    }

    /// The size of the operand record, excluding the opcode cell.
    pub fn args_size(&self) -> usize {
        match &self.kind {
            InstrKind::Simple => 0,
            InstrKind::Move { .. } | InstrKind::Dup { .. } => oa::TWO_LOCALS_SIZE,
            InstrKind::LoadValue { constant, .. } => match constant {
                LoadConst::Null | LoadConst::True | LoadConst::False | LoadConst::ArgCount => {
                    oa::ONE_LOCAL_SIZE
                }
                LoadConst::Int(_) | LoadConst::UInt(_) | LoadConst::Real(_) => {
                    oa::LOCAL_AND_VALUE64_SIZE
                }
                LoadConst::Enum(..) => oa::LOAD_ENUM_SIZE,
                LoadConst::Str(_)
                | LoadConst::ListCap(_)
                | LoadConst::HashCap(_)
                | LoadConst::StaticFunc(_)
                | LoadConst::TypeToken(_)
                | LoadConst::StaticField(_) => oa::LOCAL_AND_ID_SIZE,
            },
            InstrKind::StoreStaticField { .. } => oa::LOCAL_AND_ID_SIZE,
            InstrKind::LoadField { .. } | InstrKind::LoadMember { .. } => {
                oa::TWO_LOCALS_AND_ID_SIZE
            }
            InstrKind::StoreField { .. } | InstrKind::StoreMember { .. } => oa::LOCAL_AND_ID_SIZE,
            InstrKind::LoadIterator { .. } | InstrKind::LoadTypeOf { .. } => oa::TWO_LOCALS_SIZE,
            InstrKind::LoadIndexer { .. } => oa::TWO_LOCALS_AND_ID_SIZE,
            InstrKind::StoreIndexer { .. } => oa::LOCAL_AND_ID_SIZE,
            InstrKind::NewObject { .. } => oa::NEW_OBJECT_SIZE,
            InstrKind::Call { ref_signature, .. } => {
                if *ref_signature != 0 {
                    oa::CALL_REF_SIZE
                } else {
                    oa::CALL_SIZE
                }
            }
            InstrKind::CallMember { ref_signature, .. } => {
                if *ref_signature != 0 {
                    oa::CALL_MEMBER_REF_SIZE
                } else {
                    oa::CALL_MEMBER_SIZE
                }
            }
            InstrKind::StaticCall { .. } => oa::STATIC_CALL_SIZE,
            InstrKind::Apply { .. } => oa::TWO_LOCALS_SIZE,
            InstrKind::StaticApply { .. } => oa::STATIC_APPLY_SIZE,
            InstrKind::Branch { .. } => oa::BRANCH_SIZE,
            InstrKind::CondBranch { .. }
            | InstrKind::BranchRef { .. }
            | InstrKind::BranchComparison { .. } => oa::COND_BRANCH_SIZE,
            InstrKind::BranchIfType { .. } => oa::BRANCH_IF_TYPE_SIZE,
            InstrKind::Switch { targets, .. } => oa::switch_size(targets.len()),
            InstrKind::Operator { .. } => oa::OPERATOR_SIZE,
            InstrKind::CompareOp { .. } => oa::TWO_LOCALS_SIZE,
            InstrKind::LoadLocalRef { .. } => oa::ONE_LOCAL_SIZE,
            InstrKind::LoadMemberRef { .. } | InstrKind::LoadFieldRef { .. } => {
                oa::LOCAL_AND_ID_SIZE
            }
            InstrKind::LoadStaticFieldRef { .. } => oa::SINGLE_ID_SIZE,
        }
    }

    /// Total emitted size, including the opcode cell.
    pub fn size(&self) -> usize {
        oa::OPCODE_SIZE + self.args_size()
    }

    /// Assigns the instruction's input location. `on_stack` updates the
    /// opcode's input bit for the instructions that encode it.
    pub fn update_input(&mut self, offset: LocalOffset, on_stack: bool) {
        match &mut self.kind {
            InstrKind::Move { source, .. } => {
                match self.opcode {
                    InternalOp::MvlocSR | InternalOp::MvlocLR => {
                        self.opcode = if on_stack {
                            InternalOp::MvlocSR
                        } else {
                            InternalOp::MvlocLR
                        };
                    }
                    _ => self.opcode = self.opcode.with_low_bit(on_stack),
                }
                *source = offset;
            }
            InstrKind::Dup { source, .. } => {
                debug_assert!(on_stack);
                *source = offset;
            }
            InstrKind::StoreStaticField { value, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *value = offset;
            }
            InstrKind::LoadField { instance, .. } | InstrKind::LoadMember { instance, .. } => {
                debug_assert!(on_stack);
                *instance = offset;
            }
            InstrKind::LoadIterator { value, .. } => {
                debug_assert!(on_stack);
                *value = offset;
            }
            InstrKind::LoadTypeOf { source, .. } => {
                debug_assert!(on_stack);
                *source = offset;
            }
            InstrKind::StoreField { args, .. }
            | InstrKind::StoreMember { args, .. }
            | InstrKind::LoadIndexer { args, .. }
            | InstrKind::StoreIndexer { args, .. }
            | InstrKind::NewObject { args, .. }
            | InstrKind::Call { args, .. }
            | InstrKind::CallMember { args, .. }
            | InstrKind::StaticCall { args, .. }
            | InstrKind::Apply { args, .. }
            | InstrKind::StaticApply { args, .. }
            | InstrKind::BranchRef { args, .. }
            | InstrKind::BranchComparison { args, .. }
            | InstrKind::Operator { args, .. }
            | InstrKind::CompareOp { args, .. } => {
                debug_assert!(on_stack);
                *args = offset;
            }
            InstrKind::CondBranch { value, .. } | InstrKind::BranchIfType { value, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *value = offset;
            }
            InstrKind::Switch { value, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *value = offset;
            }
            InstrKind::LoadMemberRef { instance, .. } | InstrKind::LoadFieldRef { instance, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *instance = offset;
            }
            InstrKind::Simple
            | InstrKind::LoadValue { .. }
            | InstrKind::Branch { .. }
            | InstrKind::LoadLocalRef { .. }
            | InstrKind::LoadStaticFieldRef { .. } => {}
        }
    }

    /// Assigns the instruction's output location. `on_stack` updates the
    /// opcode's output bit.
    pub fn update_output(&mut self, offset: LocalOffset, on_stack: bool) {
        match &mut self.kind {
            InstrKind::Move { target, role, .. } => {
                match (*role, self.opcode) {
                    (MoveRole::Load, InternalOp::MvlocRS) | (MoveRole::Load, InternalOp::MvlocRL) => {
                        self.opcode = if on_stack {
                            InternalOp::MvlocRS
                        } else {
                            InternalOp::MvlocRL
                        };
                    }
                    _ => self.opcode = self.opcode.with_push_bit(on_stack),
                }
                *target = offset;
            }
            InstrKind::Dup { target, .. } => {
                if on_stack {
                    // The duplicate goes to the slot above the original.
                    *target = offset.next();
                    self.opcode = self.opcode.with_push_bit(true);
                } else {
                    *target = offset;
                    self.opcode = self.opcode.with_push_bit(false);
                }
            }
            InstrKind::LoadValue { target, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *target = offset;
            }
            InstrKind::LoadField { output, .. }
            | InstrKind::LoadMember { output, .. }
            | InstrKind::LoadIndexer { output, .. }
            | InstrKind::Call { output, .. }
            | InstrKind::CallMember { output, .. }
            | InstrKind::StaticCall { output, .. }
            | InstrKind::Apply { output, .. }
            | InstrKind::StaticApply { output, .. }
            | InstrKind::Operator { output, .. }
            | InstrKind::CompareOp { output, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *output = offset;
            }
            InstrKind::LoadIterator { output, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *output = offset;
            }
            InstrKind::LoadTypeOf { target, .. } | InstrKind::NewObject { target, .. } => {
                self.opcode = self.opcode.with_low_bit(on_stack);
                *target = offset;
            }
            _ => {}
        }
    }

    /// Embeds a computed reference signature. For the dynamic calls a
    /// nonzero signature also switches the opcode to the ref-aware variant.
    pub fn apply_ref_signature(&mut self, signature: u32) {
        match &mut self.kind {
            InstrKind::Call { ref_signature, .. } => {
                *ref_signature = signature;
                if signature != 0 {
                    self.opcode = InternalOp::CallRL.with_low_bit(self.opcode.low_bit());
                }
            }
            InstrKind::CallMember { ref_signature, .. } => {
                *ref_signature = signature;
                if signature != 0 {
                    self.opcode = InternalOp::CallMemRL.with_low_bit(self.opcode.low_bit());
                }
            }
            InstrKind::StaticCall { ref_signature, .. }
            | InstrKind::NewObject { ref_signature, .. } => {
                // Validated against the callee at initialization time; the
                // emitted record does not carry the signature.
                *ref_signature = signature;
            }
            _ => {}
        }
    }

    pub fn ref_signature(&self) -> u32 {
        match &self.kind {
            InstrKind::Call { ref_signature, .. }
            | InstrKind::CallMember { ref_signature, .. }
            | InstrKind::StaticCall { ref_signature, .. }
            | InstrKind::NewObject { ref_signature, .. } => *ref_signature,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

impl Instruction {
    /// Serializes the instruction. `resolve` converts a branch target
    /// (builder index) into a signed byte offset relative to the end of this
    /// instruction.
    pub fn write(&self, buf: &mut MethodBuffer, resolve: &mut dyn FnMut(usize) -> i32) {
        buf.write_opcode(self.opcode);
        match &self.kind {
            InstrKind::Simple => {}
            InstrKind::Move { source, target, .. } | InstrKind::Dup { source, target } => {
                buf.write_i32(source.0);
                buf.write_i32(target.0);
            }
            InstrKind::LoadValue { target, constant } => {
                buf.write_i32(target.0);
                match constant {
                    LoadConst::Null | LoadConst::True | LoadConst::False | LoadConst::ArgCount => {}
                    LoadConst::Int(v) => buf.write_i64(*v),
                    LoadConst::UInt(v) => buf.write_u64(*v),
                    LoadConst::Real(v) => buf.write_f64(*v),
                    LoadConst::Str(id) => buf.write_u32(id.0),
                    LoadConst::Enum(ty, v) => {
                        buf.write_u32(ty.0);
                        buf.write_i64(*v);
                    }
                    LoadConst::ListCap(c) | LoadConst::HashCap(c) => buf.write_i32(*c),
                    LoadConst::StaticFunc(m) => buf.write_u32(m.0),
                    LoadConst::TypeToken(t) => buf.write_u32(t.0),
                    LoadConst::StaticField(f) => buf.write_u32(f.0),
                }
            }
            InstrKind::StoreStaticField { value, field } => {
                buf.write_i32(value.0);
                buf.write_u32(field.0);
            }
            InstrKind::LoadField {
                instance,
                output,
                field,
            } => {
                buf.write_i32(instance.0);
                buf.write_i32(output.0);
                buf.write_u32(field.0);
            }
            InstrKind::StoreField { args, field } => {
                buf.write_i32(args.0);
                buf.write_u32(field.0);
            }
            InstrKind::LoadMember {
                instance,
                output,
                member,
            } => {
                buf.write_i32(instance.0);
                buf.write_i32(output.0);
                buf.write_u32(member.0);
            }
            InstrKind::StoreMember { args, member } => {
                buf.write_i32(args.0);
                buf.write_u32(member.0);
            }
            InstrKind::LoadIterator { value, output } => {
                buf.write_i32(value.0);
                buf.write_i32(output.0);
            }
            InstrKind::LoadTypeOf { source, target } => {
                buf.write_i32(source.0);
                buf.write_i32(target.0);
            }
            InstrKind::LoadIndexer {
                args,
                output,
                arg_count,
            } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
                buf.write_u32(*arg_count);
            }
            InstrKind::StoreIndexer { args, arg_count } => {
                buf.write_i32(args.0);
                buf.write_u32(*arg_count);
            }
            InstrKind::NewObject {
                args,
                target,
                type_id,
                arg_count,
                ..
            } => {
                buf.write_i32(args.0);
                buf.write_i32(target.0);
                buf.write_u32(*arg_count);
                buf.write_u32(type_id.0);
            }
            InstrKind::Call {
                args,
                output,
                arg_count,
                ref_signature,
            } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
                buf.write_u32(*arg_count);
                if *ref_signature != 0 {
                    buf.write_u32(*ref_signature);
                }
            }
            InstrKind::CallMember {
                args,
                output,
                member,
                arg_count,
                ref_signature,
            } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
                buf.write_u32(*arg_count);
                if *ref_signature != 0 {
                    buf.write_u32(*ref_signature);
                }
                buf.write_u32(member.0);
            }
            InstrKind::StaticCall {
                args,
                output,
                arg_count,
                method,
                overload,
                ..
            } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
                buf.write_u32(*arg_count);
                buf.write_u32(method.0);
                buf.write_u32(*overload);
            }
            InstrKind::Apply { args, output } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
            }
            InstrKind::StaticApply {
                args,
                output,
                method,
            } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
                buf.write_u32(method.0);
            }
            InstrKind::Branch { target } => {
                buf.write_i32(resolve(*target));
            }
            InstrKind::CondBranch { value, target } => {
                buf.write_i32(value.0);
                buf.write_i32(resolve(*target));
            }
            InstrKind::BranchIfType {
                value,
                target,
                type_id,
            } => {
                buf.write_i32(value.0);
                buf.write_i32(resolve(*target));
                buf.write_u32(type_id.0);
            }
            InstrKind::BranchRef { args, target }
            | InstrKind::BranchComparison { args, target } => {
                buf.write_i32(args.0);
                buf.write_i32(resolve(*target));
            }
            InstrKind::Switch { value, targets } => {
                buf.write_i32(value.0);
                buf.write_u32(targets.len() as u32);
                for target in targets {
                    buf.write_i32(resolve(*target));
                }
                // The table is made of 4-byte entries, so this is a no-op;
                // kept so the invariant survives any layout change.
                buf.align_to(oa::INSTR_ALIGNMENT);
            }
            InstrKind::Operator { args, output, op } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
                buf.write_u32(u8::from(*op) as u32);
            }
            InstrKind::CompareOp { args, output } => {
                buf.write_i32(args.0);
                buf.write_i32(output.0);
            }
            InstrKind::LoadLocalRef { local } => {
                buf.write_i32(local.0);
            }
            InstrKind::LoadMemberRef { instance, member } => {
                buf.write_i32(instance.0);
                buf.write_u32(member.0);
            }
            InstrKind::LoadFieldRef { instance, field } => {
                buf.write_i32(instance.0);
                buf.write_u32(field.0);
            }
            InstrKind::LoadStaticFieldRef { field } => {
                buf.write_u32(field.0);
            }
        }
    }
}
