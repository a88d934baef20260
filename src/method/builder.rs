//! The ordered instruction list a method is rewritten through.
//!
//! For every instruction the builder keeps the original byte offset and
//! size, the stack height on entry computed by the analyzer, the derived
//! reference signature, and a removal flag. Removed instructions stay in the
//! list — they may be branch targets or the first instruction of a
//! protected region — until [`MethodBuilder::perform_removals`] compacts
//! everything and rewrites the targets.

use ovum_core::TypeId;

use crate::method::instructions::Instruction;
use crate::runtime::method::{DebugSymbols, TryBlock, TryHandler};

#[derive(Debug)]
struct InstrDesc {
    original_offset: u32,
    original_size: usize,
    /// Stack height on entry; `None` means no branch of evaluation has
    /// visited the instruction yet.
    stack_height: Option<u32>,
    ref_signature: u32,
    removed: bool,
    new_offset: usize,
    instr: Instruction,
}

#[derive(Debug, Default)]
pub struct MethodBuilder {
    instructions: Vec<InstrDesc>,
    last_offset: usize,
    has_branches: bool,
    types_to_initialize: Vec<TypeId>,
}

impl MethodBuilder {
    pub fn new() -> MethodBuilder {
        MethodBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Total byte size of the instructions currently in the list. Only valid
    /// once no further mutation can change instruction sizes.
    pub fn byte_size(&self) -> usize {
        self.last_offset
    }

    pub fn has_branches(&self) -> bool {
        self.has_branches
    }

    pub fn instr(&self, index: usize) -> &Instruction {
        &self.instructions[index].instr
    }

    pub fn instr_mut(&mut self, index: usize) -> &mut Instruction {
        &mut self.instructions[index].instr
    }

    pub fn replace_instr(&mut self, index: usize, instr: Instruction) {
        self.instructions[index].instr = instr;
    }

    /// Appends an instruction, assigning its provisional byte offset.
    pub fn append(&mut self, original_offset: u32, original_size: usize, instr: Instruction) {
        let new_offset = self.last_offset;
        self.last_offset += instr.size();
        self.has_branches = self.has_branches || instr.is_branch() || instr.is_switch();
        self.instructions.push(InstrDesc {
            original_offset,
            original_size,
            stack_height: None,
            ref_signature: 0,
            removed: false,
            new_offset,
            instr,
        });
    }

    pub fn original_offset(&self, index: usize) -> u32 {
        self.instructions[index].original_offset
    }

    /// The source byte size of the instruction at `index`.
    pub fn original_size(&self, index: usize) -> usize {
        self.instructions[index].original_size
    }

    /// Binary search by original byte offset. Offsets between instructions
    /// or past the last one answer with the instruction count, which is how
    /// try-block and debug-symbol end offsets equal to the method's end map
    /// to index == count. Callers validating branch targets must check the
    /// answer against [`MethodBuilder::len`].
    pub fn find_index(&self, original_offset: u32) -> usize {
        let mut lo = 0usize;
        let mut hi = self.instructions.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_offset = self.instructions[mid].original_offset;
            if original_offset < mid_offset {
                hi = mid;
            } else if original_offset > mid_offset {
                lo = mid + 1;
            } else {
                return mid;
            }
        }
        if lo < self.instructions.len() && self.instructions[lo].original_offset == original_offset
        {
            lo
        } else {
            self.instructions.len()
        }
    }

    /// Whether `original_offset` names an exact instruction boundary.
    pub fn is_instruction_boundary(&self, original_offset: u32) -> bool {
        let index = self.find_index(original_offset);
        index < self.instructions.len()
            && self.instructions[index].original_offset == original_offset
    }

    pub fn stack_height(&self, index: usize) -> Option<u32> {
        self.instructions[index].stack_height
    }

    pub fn set_stack_height(&mut self, index: usize, height: u32) {
        debug_assert!(
            self.instructions[index].stack_height.is_none(),
            "stack height set twice for instruction {index}"
        );
        self.instructions[index].stack_height = Some(height);
    }

    pub fn ref_signature(&self, index: usize) -> u32 {
        self.instructions[index].ref_signature
    }

    pub fn set_ref_signature(&mut self, index: usize, signature: u32) {
        self.instructions[index].ref_signature = signature;
    }

    /// Flags the instruction for removal. The descriptor is kept: the
    /// instruction may still be a branch target, and its recorded stack
    /// height is needed to verify that it is reached consistently on every
    /// path.
    pub fn mark_for_removal(&mut self, index: usize) {
        self.instructions[index].removed = true;
    }

    pub fn is_marked_for_removal(&self, index: usize) -> bool {
        self.instructions[index].removed
    }

    /// Records a type whose static constructor must run before the method
    /// executes. Duplicates are elided; `already_ran` callers skip types
    /// whose constructor has completed.
    pub fn add_type_to_initialize(&mut self, type_id: TypeId, already_ran: bool) {
        if already_ran {
            return;
        }
        if !self.types_to_initialize.contains(&type_id) {
            self.types_to_initialize.push(type_id);
        }
    }

    pub fn types_to_initialize(&self) -> &[TypeId] {
        &self.types_to_initialize
    }

    /// Erases removed and unvisited (unreachable) instructions, recomputes
    /// every byte offset, and rewrites all branch and switch targets plus
    /// the try-block and debug-symbol indices to the compacted index space.
    /// A target that pointed at an erased instruction is forwarded to the
    /// next surviving one.
    pub fn perform_removals(
        &mut self,
        try_blocks: &mut [TryBlock],
        debug_symbols: Option<&mut DebugSymbols>,
    ) {
        let old_len = self.instructions.len();
        let mut new_indices = vec![0usize; old_len + 1];

        let mut new_index = 0usize;
        for (old_index, desc) in self.instructions.iter().enumerate() {
            new_indices[old_index] = new_index;
            if desc.stack_height.is_some() && !desc.removed {
                new_index += 1;
            }
        }
        // End offsets may reference one past the last instruction.
        new_indices[old_len] = new_index;

        self.last_offset = 0;
        self.instructions
            .retain(|desc| desc.stack_height.is_some() && !desc.removed);
        for desc in &mut self.instructions {
            desc.new_offset = self.last_offset;
            self.last_offset += desc.instr.size();
        }

        if self.has_branches {
            for desc in &mut self.instructions {
                if let Some(target) = desc.instr.branch_target_mut() {
                    *target = new_indices[*target];
                } else if let Some(targets) = desc.instr.switch_targets_mut() {
                    for target in targets {
                        *target = new_indices[*target];
                    }
                }
            }
        }

        for block in try_blocks.iter_mut() {
            block.try_start = new_indices[block.try_start as usize] as u32;
            block.try_end = new_indices[block.try_end as usize] as u32;
            match &mut block.handler {
                TryHandler::Catch(catches) => {
                    for c in catches {
                        c.start = new_indices[c.start as usize] as u32;
                        c.end = new_indices[c.end as usize] as u32;
                    }
                }
                TryHandler::Finally { start, end } => {
                    *start = new_indices[*start as usize] as u32;
                    *end = new_indices[*end as usize] as u32;
                }
            }
        }

        if let Some(debug) = debug_symbols {
            for sym in &mut debug.symbols {
                sym.start = new_indices[sym.start as usize] as u32;
                sym.end = new_indices[sym.end as usize] as u32;
            }
        }
    }

    /// The byte offset of an instruction in the final stream. An index equal
    /// to the instruction count answers with the total byte size.
    pub fn new_offset(&self, index: usize) -> usize {
        if index >= self.instructions.len() {
            match self.instructions.last() {
                Some(last) => last.new_offset + last.instr.size(),
                None => 0,
            }
        } else {
            self.instructions[index].new_offset
        }
    }

    /// The signed jump offset from the end of instruction `relative_to` to
    /// the start of instruction `index`.
    pub fn jump_offset(&self, index: usize, relative_to: usize) -> i32 {
        let origin = &self.instructions[relative_to];
        let origin_end = origin.new_offset + origin.instr.size();
        self.new_offset(index) as i32 - origin_end as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::instructions::Instruction;
    use crate::runtime::method::{CatchBlock, CaughtType};

    fn builder_with(instrs: Vec<(u32, Instruction)>) -> MethodBuilder {
        let mut b = MethodBuilder::new();
        for (offset, instr) in instrs {
            b.append(offset, 1, instr);
        }
        b
    }

    #[test]
    fn find_index_exact_and_past_end() {
        let b = builder_with(vec![
            (0, Instruction::load_int(1)),
            (9, Instruction::load_int(2)),
            (18, Instruction::ret()),
        ]);
        assert_eq!(b.find_index(0), 0);
        assert_eq!(b.find_index(9), 1);
        assert_eq!(b.find_index(18), 2);
        // The method's end offset maps to index == count.
        assert_eq!(b.find_index(19), 3);
        // Mid-instruction offsets are not boundaries.
        assert_eq!(b.find_index(5), 3);
        assert!(!b.is_instruction_boundary(5));
        assert!(b.is_instruction_boundary(9));
    }

    #[test]
    fn offsets_accumulate() {
        let b = builder_with(vec![
            (0, Instruction::load_int(1)),  // 16 bytes
            (9, Instruction::load_int(2)),  // 16 bytes
            (18, Instruction::ret()),       // 4 bytes
        ]);
        assert_eq!(b.new_offset(0), 0);
        assert_eq!(b.new_offset(1), 16);
        assert_eq!(b.new_offset(2), 32);
        assert_eq!(b.byte_size(), 36);
        // Past-end index answers the total size.
        assert_eq!(b.new_offset(3), 36);
    }

    #[test]
    fn perform_removals_forwards_targets() {
        // 0: br -> 2, 1: load (to be removed), 2: load, 3: ret
        let mut b = builder_with(vec![
            (0, Instruction::branch(2, false)),
            (5, Instruction::load_int(1)),
            (14, Instruction::load_int(2)),
            (23, Instruction::ret()),
        ]);
        for i in 0..4 {
            b.set_stack_height(i, 0);
        }
        b.mark_for_removal(1);

        let mut try_blocks = vec![TryBlock {
            try_start: 1,
            try_end: 4,
            handler: TryHandler::Catch(vec![CatchBlock {
                caught_type: CaughtType::Resolved(TypeId(0)),
                start: 2,
                end: 3,
            }]),
        }];
        b.perform_removals(&mut try_blocks, None);

        assert_eq!(b.len(), 3);
        // The branch's target (old 2) is now instruction 1.
        assert_eq!(b.instr(0).branch_target(), Some(1));
        // The try block that started at the removed instruction forwards to
        // the next surviving one.
        assert_eq!(try_blocks[0].try_start, 1);
        assert_eq!(try_blocks[0].try_end, 3);
        match &try_blocks[0].handler {
            TryHandler::Catch(catches) => {
                assert_eq!(catches[0].start, 1);
                assert_eq!(catches[0].end, 2);
            }
            _ => unreachable!(),
        }

        // Offsets are recomputed and strictly increasing.
        assert_eq!(b.new_offset(0), 0);
        assert!(b.new_offset(1) > 0);
        assert!(b.new_offset(2) > b.new_offset(1));
    }

    #[test]
    fn unvisited_instructions_are_dropped() {
        let mut b = builder_with(vec![
            (0, Instruction::load_int(1)),
            (9, Instruction::ret()),
            (10, Instruction::load_int(3)), // unreachable
        ]);
        b.set_stack_height(0, 0);
        b.set_stack_height(1, 1);
        b.perform_removals(&mut [], None);
        assert_eq!(b.len(), 2);
        for i in 0..b.len() {
            assert!(!b.is_marked_for_removal(i));
        }
    }

    #[test]
    fn jump_offsets_are_relative_to_instruction_end() {
        let b = builder_with(vec![
            (0, Instruction::branch(2, false)), // 8 bytes
            (5, Instruction::load_int(1)),      // 16 bytes
            (14, Instruction::ret()),           // 4 bytes
        ]);
        // Branch at [0,8); target at 24 -> offset 16.
        assert_eq!(b.jump_offset(2, 0), 16);
        // Backward jump to self start: -8.
        assert_eq!(b.jump_offset(0, 0), -8);
    }

    #[test]
    fn types_to_initialize_dedupes() {
        let mut b = MethodBuilder::new();
        b.add_type_to_initialize(TypeId(1), false);
        b.add_type_to_initialize(TypeId(1), false);
        b.add_type_to_initialize(TypeId(2), true);
        b.add_type_to_initialize(TypeId(3), false);
        assert_eq!(b.types_to_initialize(), &[TypeId(1), TypeId(3)]);
    }
}
