//! The source-bytecode parser.
//!
//! Walks the source instruction stream of one overload and produces exactly
//! one intermediate instruction per source opcode, resolving and validating
//! every token along the way. Once the whole method is parsed, branch
//! targets, try-block bounds and debug-symbol ranges are translated from
//! byte offsets into builder instruction indices, so the rest of the
//! pipeline never deals in source offsets again.
//!
//! The parser does not validate stack heights or reference signatures; that
//! is the analyzer's job.

use std::sync::Arc;

use ovum_core::{
    FieldId, MethodId, MethodInitError, MethodInitErrorKind, StrId, Token, TypeId,
};

use crate::bytecode::internal::LocalOffset;
use crate::bytecode::opcode::Opcode;
use crate::method::builder::MethodBuilder;
use crate::method::instructions::{BranchCondition, Instruction};
use crate::runtime::method::{
    BytecodeBody, CaughtType, DebugSymbols, MethodBody, MethodOverload, TryBlock, TryHandler,
};
use crate::runtime::type_info::{Operator, StaticCtorState};
use crate::vm::vm::Vm;

use crate::bytecode::internal::InternalOp;

/// Try blocks and debug symbols translated to instruction indices, with
/// catch types resolved.
#[derive(Debug)]
pub struct ParsedMethod {
    pub try_blocks: Vec<TryBlock>,
    pub debug_symbols: Option<DebugSymbols>,
}

pub struct MethodParser<'a> {
    vm: &'a Vm,
    method: &'a MethodOverload,
    method_name: Arc<str>,
    body: &'a BytecodeBody,
    ip: usize,
}

impl<'a> MethodParser<'a> {
    /// Parses the method's source bytecode into `builder`. The builder must
    /// be empty and the method an uninitialized bytecode method. On error
    /// the builder is left in an unspecified state and must be discarded.
    pub fn parse_into(
        vm: &'a Vm,
        method: &'a MethodOverload,
        builder: &mut MethodBuilder,
    ) -> Result<ParsedMethod, MethodInitError> {
        let MethodBody::Bytecode(body) = &method.body else {
            panic!("cannot parse a native method");
        };
        let mut parser = MethodParser {
            vm,
            method,
            method_name: vm.qualified_method_name(method.group),
            body,
            ip: 0,
        };

        while !parser.at_end() {
            parser.parse_instruction(builder)?;
        }
        parser.init_branch_offsets(builder)?;
        let try_blocks = parser.init_try_block_offsets(builder)?;
        let debug_symbols = parser.init_debug_symbol_offsets(builder)?;
        Ok(ParsedMethod {
            try_blocks,
            debug_symbols,
        })
    }

    fn at_end(&self) -> bool {
        self.ip == self.body.code.len()
    }

    fn general(&self, message: impl Into<String>) -> MethodInitError {
        MethodInitError::general(Arc::clone(&self.method_name), message)
    }

    // ------------------------------------------------------------------
    // Stream readers
    // ------------------------------------------------------------------

    fn take(&mut self, n: usize) -> Result<&'a [u8], MethodInitError> {
        if self.ip + n > self.body.code.len() {
            return Err(self.general("unexpected end of method body"));
        }
        let slice = &self.body.code[self.ip..self.ip + n];
        self.ip += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, MethodInitError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MethodInitError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, MethodInitError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, MethodInitError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, MethodInitError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, MethodInitError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64, MethodInitError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    // ------------------------------------------------------------------
    // Instruction decoding
    // ------------------------------------------------------------------

    /// Reads a branch operand and returns the absolute source offset of its
    /// target, stored as a provisional target until the whole method has
    /// been parsed.
    fn read_branch_target(&mut self) -> Result<usize, MethodInitError> {
        let rel = self.read_i32()? as i64;
        // Offsets are relative to the end of the instruction; the operand is
        // the last field of every branch.
        let abs = self.ip as i64 + rel;
        if abs < 0 || abs > self.body.code.len() as i64 {
            return Err(MethodInitError::at_instruction(
                MethodInitErrorKind::InvalidBranchOffset,
                Arc::clone(&self.method_name),
                self.ip,
                format!("branch target {abs} is outside the method body"),
            ));
        }
        Ok(abs as usize)
    }

    fn argument_offset(&self, index: u16) -> Result<(LocalOffset, bool), MethodInitError> {
        let argc = self.method.effective_param_count();
        if index as u32 >= argc {
            return Err(self.general(format!("argument index {index} out of range")));
        }
        // The declared ref signature reserves bit 0 for the instance; static
        // methods skip it.
        let bit = index as u32 + (!self.method.is_instance()) as u32;
        let is_ref = self
            .vm
            .ref_signatures()
            .is_param_ref(self.method.ref_signature, bit);
        Ok((LocalOffset::argument(index as u32, argc), is_ref))
    }

    fn local_offset(&self, index: u16) -> Result<LocalOffset, MethodInitError> {
        if index as u32 >= self.body.locals {
            return Err(self.general(format!("local index {index} out of range")));
        }
        Ok(LocalOffset::local(index as u32))
    }

    fn parse_instruction(&mut self, builder: &mut MethodBuilder) -> Result<(), MethodInitError> {
        let start = self.ip;
        let raw = self.read_u8()?;
        let opcode = Opcode::try_from(raw)
            .map_err(|_| self.general(format!("invalid opcode 0x{raw:02X}")))?;

        let instr = match opcode {
            Opcode::Nop => Instruction::nop(),
            Opcode::Pop => Instruction::pop(),
            Opcode::Dup => Instruction::dup(),
            Opcode::Ret => Instruction::ret(),
            Opcode::RetNull => Instruction::ret_null(),

            Opcode::LdArg => {
                let (offset, is_ref) = {
                    let index = self.read_u16()?;
                    self.argument_offset(index)?
                };
                Instruction::load_local(offset, is_ref)
            }
            Opcode::StArg => {
                let (offset, is_ref) = {
                    let index = self.read_u16()?;
                    self.argument_offset(index)?
                };
                Instruction::store_local(offset, is_ref)
            }
            Opcode::LdLoc => {
                let index = self.read_u16()?;
                Instruction::load_local(self.local_offset(index)?, false)
            }
            Opcode::StLoc => {
                let index = self.read_u16()?;
                Instruction::store_local(self.local_offset(index)?, false)
            }
            Opcode::LdArgc => Instruction::load_argc(),

            Opcode::LdNull => Instruction::load_null(),
            Opcode::LdFalse => Instruction::load_bool(false),
            Opcode::LdTrue => Instruction::load_bool(true),
            Opcode::LdcI => Instruction::load_int(self.read_i64()?),
            Opcode::LdcU => Instruction::load_uint(self.read_u64()?),
            Opcode::LdcR => Instruction::load_real(self.read_f64()?),
            Opcode::LdStr => {
                let token = self.read_u32()?;
                Instruction::load_string(self.string_from_token(token)?)
            }
            Opcode::LdEnum => {
                let token = self.read_u32()?;
                let value = self.read_i64()?;
                let type_id = self.type_from_token(token)?;
                self.register_type_init(builder, type_id);
                Instruction::load_enum(type_id, value)
            }
            Opcode::List => Instruction::create_list(self.read_i32()?),
            Opcode::Hash => Instruction::create_hash(self.read_i32()?),
            Opcode::LdSfn => {
                let token = self.read_u32()?;
                let method = self.method_from_token(token)?;
                if let Some(ty) = self.vm.method(method).decl_type {
                    self.register_type_init(builder, ty);
                }
                Instruction::load_static_function(method)
            }
            Opcode::LdTypeTkn => {
                let token = self.read_u32()?;
                Instruction::load_type_token(self.type_from_token(token)?)
            }

            Opcode::NewObj => {
                let token = self.read_u32()?;
                let argc = self.read_u16()? as u32;
                let type_id = self.type_from_token(token)?;
                self.ensure_constructible(type_id, argc)?;
                self.register_type_init(builder, type_id);
                Instruction::new_object(type_id, argc)
            }
            Opcode::Call => {
                let argc = self.read_u16()? as u32;
                Instruction::call(argc)
            }
            Opcode::SCall => {
                let token = self.read_u32()?;
                let argc = self.read_u16()? as u32;
                let (method, overload_index, overload) =
                    self.method_overload_from_token(token, argc)?;
                let pops_instance = overload.is_instance();
                if let Some(ty) = self.vm.method(method).decl_type {
                    self.register_type_init(builder, ty);
                }
                Instruction::static_call(argc, method, overload_index, pops_instance)
            }
            Opcode::CallMem => {
                let token = self.read_u32()?;
                let argc = self.read_u16()? as u32;
                Instruction::call_member(self.string_from_token(token)?, argc)
            }
            Opcode::Apply => Instruction::apply(),
            Opcode::SApply => {
                let token = self.read_u32()?;
                let method = self.method_from_token(token)?;
                if !self.vm.method(method).is_static() {
                    return Err(self.general("sapply requires a static method group"));
                }
                Instruction::static_apply(method)
            }

            Opcode::LdFld => {
                let token = self.read_u32()?;
                Instruction::load_field(self.field_from_token(token, false)?, false)
            }
            Opcode::StFld => {
                let token = self.read_u32()?;
                Instruction::store_field(self.field_from_token(token, false)?, false)
            }
            Opcode::LdSFld => {
                let token = self.read_u32()?;
                let field = self.field_from_token(token, true)?;
                self.register_field_type_init(builder, field);
                Instruction::load_static_field(field)
            }
            Opcode::StSFld => {
                let token = self.read_u32()?;
                let field = self.field_from_token(token, true)?;
                self.register_field_type_init(builder, field);
                Instruction::store_static_field(field)
            }
            Opcode::LdMem => {
                let token = self.read_u32()?;
                Instruction::load_member(self.string_from_token(token)?)
            }
            Opcode::StMem => {
                let token = self.read_u32()?;
                Instruction::store_member(self.string_from_token(token)?)
            }
            Opcode::LdIdx => {
                let argc = self.read_u16()? as u32;
                Instruction::load_indexer(argc)
            }
            Opcode::StIdx => {
                let argc = self.read_u16()? as u32;
                Instruction::store_indexer(argc)
            }
            Opcode::LdIter => Instruction::load_iterator(),
            Opcode::LdType => Instruction::load_type_of(),

            Opcode::Br => {
                let target = self.read_branch_target()?;
                Instruction::branch(target, false)
            }
            Opcode::Leave => {
                let target = self.read_branch_target()?;
                Instruction::branch(target, true)
            }
            Opcode::BrNull => {
                let target = self.read_branch_target()?;
                Instruction::cond_branch(target, BranchCondition::IfNull)
            }
            Opcode::BrInst => {
                let target = self.read_branch_target()?;
                Instruction::cond_branch(target, BranchCondition::NotNull)
            }
            Opcode::BrFalse => {
                let target = self.read_branch_target()?;
                Instruction::cond_branch(target, BranchCondition::IfFalse)
            }
            Opcode::BrTrue => {
                let target = self.read_branch_target()?;
                Instruction::cond_branch(target, BranchCondition::IfTrue)
            }
            Opcode::BrType => {
                let token = self.read_u32()?;
                let type_id = self.type_from_token(token)?;
                let target = self.read_branch_target()?;
                Instruction::branch_if_type(target, type_id)
            }
            Opcode::BrRef => {
                let target = self.read_branch_target()?;
                Instruction::branch_ref(target, true)
            }
            Opcode::BrNRef => {
                let target = self.read_branch_target()?;
                Instruction::branch_ref(target, false)
            }
            Opcode::Switch => {
                let count = self.read_u16()? as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    // Switch targets are all relative to the end of the whole
                    // instruction, which we only know after reading the
                    // table; collect raw offsets first.
                    targets.push(self.read_i32()? as i64);
                }
                let end = self.ip as i64;
                let mut absolute = Vec::with_capacity(count);
                for rel in targets {
                    let abs = end + rel;
                    if abs < 0 || abs > self.body.code.len() as i64 {
                        return Err(MethodInitError::at_instruction(
                            MethodInitErrorKind::InvalidBranchOffset,
                            Arc::clone(&self.method_name),
                            start,
                            format!("switch target {abs} is outside the method body"),
                        ));
                    }
                    absolute.push(abs as usize);
                }
                Instruction::switch(absolute)
            }

            Opcode::Operator => {
                let raw = self.read_u8()?;
                let op = Operator::try_from(raw)
                    .map_err(|_| self.general(format!("invalid operator 0x{raw:02X}")))?;
                Instruction::operator(op)
            }
            Opcode::Eq => Instruction::compare_op(InternalOp::EqS),
            Opcode::Cmp => Instruction::compare_op(InternalOp::CmpS),
            Opcode::Lt => Instruction::compare_op(InternalOp::LtS),
            Opcode::Lte => Instruction::compare_op(InternalOp::LteS),
            Opcode::Gt => Instruction::compare_op(InternalOp::GtS),
            Opcode::Gte => Instruction::compare_op(InternalOp::GteS),
            Opcode::Concat => Instruction::compare_op(InternalOp::ConcatS),

            Opcode::Throw => Instruction::throw(),
            Opcode::Rethrow => Instruction::rethrow(),
            Opcode::EndFinally => Instruction::end_finally(),

            Opcode::LdLocRef => {
                let index = self.read_u16()?;
                Instruction::load_local_ref(self.local_offset(index)?)
            }
            Opcode::LdArgRef => {
                let (offset, _) = {
                    let index = self.read_u16()?;
                    self.argument_offset(index)?
                };
                Instruction::load_local_ref(offset)
            }
            Opcode::LdMemRef => {
                let token = self.read_u32()?;
                Instruction::load_member_ref(self.string_from_token(token)?)
            }
            Opcode::LdFldRef => {
                let token = self.read_u32()?;
                Instruction::load_field_ref(self.field_from_token(token, false)?)
            }
            Opcode::LdSFldRef => {
                let token = self.read_u32()?;
                let field = self.field_from_token(token, true)?;
                self.register_field_type_init(builder, field);
                Instruction::load_static_field_ref(field)
            }
        };

        builder.append(start as u32, self.ip - start, instr);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Offset translation
    // ------------------------------------------------------------------

    /// Converts an absolute source offset into a builder index, requiring an
    /// exact instruction boundary. When `allow_end`, the method's end offset
    /// maps to index == instruction count.
    fn offset_to_index(
        &self,
        builder: &MethodBuilder,
        offset: u32,
        allow_end: bool,
        what: &str,
    ) -> Result<usize, MethodInitError> {
        if allow_end && offset as usize == self.body.code.len() {
            return Ok(builder.len());
        }
        let index = builder.find_index(offset);
        if index >= builder.len() || builder.original_offset(index) != offset {
            return Err(MethodInitError::at_instruction(
                MethodInitErrorKind::InvalidBranchOffset,
                Arc::clone(&self.method_name),
                offset as usize,
                format!("{what} offset {offset} is not an instruction boundary"),
            ));
        }
        Ok(index)
    }

    /// Rewrites every branch and switch target from an absolute source
    /// offset to a builder index, and marks the targets as having incoming
    /// branches.
    fn init_branch_offsets(&self, builder: &mut MethodBuilder) -> Result<(), MethodInitError> {
        for i in 0..builder.len() {
            if let Some(target) = builder.instr(i).branch_target() {
                let index = self.offset_to_index(builder, target as u32, false, "branch")?;
                *builder.instr_mut(i).branch_target_mut().unwrap() = index;
                builder.instr_mut(index).add_incoming_branch();
            } else if builder.instr(i).is_switch() {
                let raw = builder.instr(i).switch_targets().unwrap().to_vec();
                let mut translated = Vec::with_capacity(raw.len());
                for target in raw {
                    let index = self.offset_to_index(builder, target as u32, false, "switch")?;
                    translated.push(index);
                }
                for &index in &translated {
                    builder.instr_mut(index).add_incoming_branch();
                }
                *builder.instr_mut(i).switch_targets_mut().unwrap() = translated;
            }
        }
        Ok(())
    }

    /// Translates try-block bounds to builder indices and resolves caught
    /// types. Handler entry points are marked as branch targets so that the
    /// peephole pass never folds across them.
    fn init_try_block_offsets(
        &self,
        builder: &mut MethodBuilder,
    ) -> Result<Vec<TryBlock>, MethodInitError> {
        let mut result = Vec::with_capacity(self.body.try_blocks.len());
        for block in &self.body.try_blocks {
            let try_start = self.offset_to_index(builder, block.try_start, true, "try start")?;
            let try_end = self.offset_to_index(builder, block.try_end, true, "try end")?;
            if try_start < builder.len() {
                builder.instr_mut(try_start).add_incoming_branch();
            }
            let handler = match &block.handler {
                TryHandler::Catch(catches) => {
                    let mut translated = Vec::with_capacity(catches.len());
                    for c in catches {
                        let caught = match c.caught_type {
                            CaughtType::Token(token) => self.type_from_token(token.0)?,
                            CaughtType::Resolved(id) => id,
                        };
                        let start = self.offset_to_index(builder, c.start, true, "catch start")?;
                        let end = self.offset_to_index(builder, c.end, true, "catch end")?;
                        if start < builder.len() {
                            builder.instr_mut(start).add_incoming_branch();
                        }
                        translated.push(crate::runtime::method::CatchBlock {
                            caught_type: CaughtType::Resolved(caught),
                            start: start as u32,
                            end: end as u32,
                        });
                    }
                    TryHandler::Catch(translated)
                }
                TryHandler::Finally { start, end } => {
                    let start = self.offset_to_index(builder, *start, true, "finally start")?;
                    let end = self.offset_to_index(builder, *end, true, "finally end")?;
                    if start < builder.len() {
                        builder.instr_mut(start).add_incoming_branch();
                    }
                    TryHandler::Finally {
                        start: start as u32,
                        end: end as u32,
                    }
                }
            };
            result.push(TryBlock {
                try_start: try_start as u32,
                try_end: try_end as u32,
                handler,
            });
        }
        Ok(result)
    }

    fn init_debug_symbol_offsets(
        &self,
        builder: &MethodBuilder,
    ) -> Result<Option<DebugSymbols>, MethodInitError> {
        let Some(debug) = &self.body.debug_symbols else {
            return Ok(None);
        };
        let mut symbols = Vec::with_capacity(debug.symbols.len());
        for sym in &debug.symbols {
            let start = self.offset_to_index(builder, sym.start, true, "debug symbol start")?;
            let end = self.offset_to_index(builder, sym.end, true, "debug symbol end")?;
            symbols.push(crate::runtime::method::DebugSymbol {
                start: start as u32,
                end: end as u32,
                line: sym.line,
            });
        }
        Ok(Some(DebugSymbols {
            file: Arc::clone(&debug.file),
            symbols,
        }))
    }

    // ------------------------------------------------------------------
    // Token resolution
    // ------------------------------------------------------------------

    fn from_type(&self) -> Option<TypeId> {
        self.vm.method(self.method.group).decl_type
    }

    fn type_from_token(&self, raw: u32) -> Result<TypeId, MethodInitError> {
        let token = Token(raw);
        let module = self.vm.module(self.method.module);
        let Some(id) = module.resolve_type(token) else {
            return Err(MethodInitError::for_token(
                MethodInitErrorKind::UnresolvedTokenId,
                Arc::clone(&self.method_name),
                raw,
                "unresolved type token",
            ));
        };
        let info = self.vm.type_info(id);
        if !self.vm.is_accessible(
            info.access,
            None,
            info.module,
            self.from_type(),
            self.method.module,
        ) {
            return Err(MethodInitError::for_type(
                MethodInitErrorKind::InaccessibleType,
                Arc::clone(&self.method_name),
                Arc::clone(&info.name),
                "type is not accessible from this method",
            ));
        }
        Ok(id)
    }

    fn string_from_token(&self, raw: u32) -> Result<StrId, MethodInitError> {
        let module = self.vm.module(self.method.module);
        module.resolve_string(Token(raw)).ok_or_else(|| {
            MethodInitError::for_token(
                MethodInitErrorKind::UnresolvedTokenId,
                Arc::clone(&self.method_name),
                raw,
                "unresolved string token",
            )
        })
    }

    fn method_from_token(&self, raw: u32) -> Result<MethodId, MethodInitError> {
        let module = self.vm.module(self.method.module);
        let Some(id) = module.resolve_method(Token(raw)) else {
            return Err(MethodInitError::for_token(
                MethodInitErrorKind::UnresolvedTokenId,
                Arc::clone(&self.method_name),
                raw,
                "unresolved method token",
            ));
        };
        let group = self.vm.method(id);
        // Accessibility of instance methods depends on the instance type and
        // is deferred to invocation time.
        if group.is_static()
            && !self.vm.is_accessible(
                group.access,
                group.decl_type,
                group.module,
                self.from_type(),
                self.method.module,
            )
        {
            return Err(MethodInitError::for_member(
                MethodInitErrorKind::InaccessibleMember,
                Arc::clone(&self.method_name),
                self.vm.qualified_method_name(id),
                "method is not accessible from this method",
            ));
        }
        Ok(id)
    }

    fn method_overload_from_token(
        &self,
        raw: u32,
        argc: u32,
    ) -> Result<(MethodId, u32, Arc<MethodOverload>), MethodInitError> {
        let id = self.method_from_token(raw)?;
        let group = self.vm.method(id);
        match group.resolve_overload(argc) {
            Some((index, overload)) => Ok((id, index, Arc::clone(overload))),
            None => Err(MethodInitError::no_overload(
                Arc::clone(&self.method_name),
                self.vm.qualified_method_name(id),
                argc,
                format!("no overload accepts {argc} argument(s)"),
            )),
        }
    }

    fn field_from_token(
        &self,
        raw: u32,
        should_be_static: bool,
    ) -> Result<FieldId, MethodInitError> {
        let module = self.vm.module(self.method.module);
        let Some(id) = module.resolve_field(Token(raw)) else {
            return Err(MethodInitError::for_token(
                MethodInitErrorKind::UnresolvedTokenId,
                Arc::clone(&self.method_name),
                raw,
                "unresolved field token",
            ));
        };
        let field = self.vm.field(id);
        if field.is_static() != should_be_static {
            return Err(MethodInitError::for_member(
                MethodInitErrorKind::FieldStaticMismatch,
                Arc::clone(&self.method_name),
                Arc::clone(&field.name),
                if should_be_static {
                    "expected a static field"
                } else {
                    "expected an instance field"
                },
            ));
        }
        // As with methods, instance field accessibility is deferred.
        if field.is_static() {
            let field_module = match field.decl_type {
                Some(ty) => self.vm.type_info(ty).module,
                None => self.method.module,
            };
            if !self.vm.is_accessible(
                field.access,
                field.decl_type,
                field_module,
                self.from_type(),
                self.method.module,
            ) {
                return Err(MethodInitError::for_member(
                    MethodInitErrorKind::InaccessibleMember,
                    Arc::clone(&self.method_name),
                    Arc::clone(&field.name),
                    "field is not accessible from this method",
                ));
            }
        }
        Ok(id)
    }

    fn ensure_constructible(&self, type_id: TypeId, argc: u32) -> Result<(), MethodInitError> {
        let info = self.vm.type_info(type_id);
        if info.is_abstract() || info.is_static() || info.is_primitive() {
            return Err(MethodInitError::for_type(
                MethodInitErrorKind::TypeNotConstructible,
                Arc::clone(&self.method_name),
                Arc::clone(&info.name),
                "the type cannot be constructed",
            ));
        }
        let Some(ctor) = info.instance_ctor else {
            return Err(MethodInitError::for_type(
                MethodInitErrorKind::TypeNotConstructible,
                Arc::clone(&self.method_name),
                Arc::clone(&info.name),
                "the type has no constructor",
            ));
        };
        let group = self.vm.method(ctor);
        if !self.vm.is_accessible(
            group.access,
            group.decl_type,
            group.module,
            self.from_type(),
            self.method.module,
        ) {
            return Err(MethodInitError::for_member(
                MethodInitErrorKind::InaccessibleMember,
                Arc::clone(&self.method_name),
                self.vm.qualified_method_name(ctor),
                "the constructor is not accessible from this method",
            ));
        }
        if group.resolve_overload(argc).is_none() {
            return Err(MethodInitError::no_overload(
                Arc::clone(&self.method_name),
                self.vm.qualified_method_name(ctor),
                argc,
                format!("no constructor accepts {argc} argument(s)"),
            ));
        }
        Ok(())
    }

    fn register_type_init(&self, builder: &mut MethodBuilder, type_id: TypeId) {
        let info = self.vm.type_info(type_id);
        let already_ran =
            info.static_ctor.is_none() || info.static_ctor_state() != StaticCtorState::NotRun;
        builder.add_type_to_initialize(type_id, already_ran);
    }

    fn register_field_type_init(&self, builder: &mut MethodBuilder, field: FieldId) {
        if let Some(ty) = self.vm.field(field).decl_type {
            self.register_type_init(builder, ty);
        }
    }
}
