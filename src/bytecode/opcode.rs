//! The source instruction set.
//!
//! This is the instruction stream as it arrives from a module file: a fixed
//! one-byte opcode followed by zero or more little-endian operands of fixed
//! widths. Branch offsets are signed and relative to the end of the
//! instruction; tokens reference the owning module's tables.
//!
//! The source stream is never executed directly. On a method's first
//! invocation it is rewritten into the internal instruction set (see
//! `crate::method`).

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Source operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // =========================================================================
    // Stack and frame plumbing
    // =========================================================================
    /// Do nothing.
    Nop = 0x00,
    /// Pop and discard the top value.
    Pop = 0x01,
    /// Duplicate the top value.
    Dup = 0x02,
    /// Return the top value from the method.
    Ret = 0x03,
    /// Return null from the method.
    RetNull = 0x04,

    /// Load argument. Operand: u16 index (0 = instance for instance methods).
    LdArg = 0x10,
    /// Store to argument. Operand: u16 index.
    StArg = 0x11,
    /// Load local variable. Operand: u16 index.
    LdLoc = 0x12,
    /// Store to local variable. Operand: u16 index.
    StLoc = 0x13,
    /// Push the argument count of the current invocation (including the
    /// instance).
    LdArgc = 0x14,

    // =========================================================================
    // Constants
    // =========================================================================
    /// Push null.
    LdNull = 0x20,
    /// Push false.
    LdFalse = 0x21,
    /// Push true.
    LdTrue = 0x22,
    /// Push an Int constant. Operand: i64.
    LdcI = 0x23,
    /// Push a UInt constant. Operand: u64.
    LdcU = 0x24,
    /// Push a Real constant. Operand: f64.
    LdcR = 0x25,
    /// Push a string constant. Operand: u32 string token.
    LdStr = 0x26,
    /// Push an enum value. Operands: u32 type token, i64 value.
    LdEnum = 0x27,
    /// Push a new List with the given capacity. Operand: i32.
    List = 0x28,
    /// Push a new Hash with the given capacity. Operand: i32.
    Hash = 0x29,
    /// Push a bound Method object for a static function. Operand: u32 method
    /// token.
    LdSfn = 0x2A,
    /// Push the type token object for a type. Operand: u32 type token.
    LdTypeTkn = 0x2B,

    // =========================================================================
    // Invocation and construction
    // =========================================================================
    /// Construct an object. Operands: u32 type token, u16 argc.
    NewObj = 0x30,
    /// Invoke the value below the arguments. Operand: u16 argc (excluding
    /// the invoked value).
    Call = 0x31,
    /// Invoke a resolved overload. Operands: u32 method token, u16 argc
    /// (excluding the instance).
    SCall = 0x32,
    /// Invoke a member by name. Operands: u32 string token, u16 argc.
    CallMem = 0x33,
    /// Spread a List into an invocation of the value below it.
    Apply = 0x34,
    /// Spread a List into an invocation of a static method group.
    /// Operand: u32 method token.
    SApply = 0x35,

    // =========================================================================
    // Field, member and indexer access
    // =========================================================================
    /// Load an instance field. Operand: u32 field token.
    LdFld = 0x40,
    /// Store to an instance field. Operand: u32 field token.
    StFld = 0x41,
    /// Load a static field. Operand: u32 field token.
    LdSFld = 0x42,
    /// Store to a static field. Operand: u32 field token.
    StSFld = 0x43,
    /// Load a member by name. Operand: u32 string token.
    LdMem = 0x44,
    /// Store to a member by name. Operand: u32 string token.
    StMem = 0x45,
    /// Invoke the indexer getter. Operand: u16 argc (excluding instance).
    LdIdx = 0x46,
    /// Invoke the indexer setter. Operand: u16 argc (excluding instance and
    /// the stored value).
    StIdx = 0x47,
    /// Invoke the `.iter` member of the top value.
    LdIter = 0x48,
    /// Pop a value and push its type token object (null stays null).
    LdType = 0x49,

    // =========================================================================
    // Control flow
    // =========================================================================
    /// Unconditional branch. Operand: i32 offset.
    Br = 0x50,
    /// Branch out of a protected region, running enclosing finally clauses.
    /// Operand: i32 offset.
    Leave = 0x51,
    /// Branch if null. Operand: i32 offset.
    BrNull = 0x52,
    /// Branch if not null. Operand: i32 offset.
    BrInst = 0x53,
    /// Branch if false. Operand: i32 offset.
    BrFalse = 0x54,
    /// Branch if true. Operand: i32 offset.
    BrTrue = 0x55,
    /// Branch if the value is of a type. Operands: u32 type token, i32 offset.
    BrType = 0x56,
    /// Branch if two values are the same reference. Operand: i32 offset.
    BrRef = 0x57,
    /// Branch if two values are not the same reference. Operand: i32 offset.
    BrNRef = 0x58,
    /// Jump table on an Int selector. Operands: u16 count, count × i32
    /// offsets. Negative or out-of-range selectors fall through.
    Switch = 0x59,

    // =========================================================================
    // Operators
    // =========================================================================
    /// Invoke an operator. Operand: u8 operator.
    Operator = 0x60,
    /// `==`.
    Eq = 0x61,
    /// `<=>`.
    Cmp = 0x62,
    /// `<`.
    Lt = 0x63,
    /// `<=`.
    Lte = 0x64,
    /// `>`.
    Gt = 0x65,
    /// `>=`.
    Gte = 0x66,
    /// String concatenation.
    Concat = 0x67,

    // =========================================================================
    // Exceptions
    // =========================================================================
    /// Throw the top value.
    Throw = 0x70,
    /// Rethrow the error being handled. Only valid inside a catch clause.
    Rethrow = 0x71,
    /// End a finally clause.
    EndFinally = 0x72,

    // =========================================================================
    // References
    // =========================================================================
    /// Push a reference to a local variable. Operand: u16 index.
    LdLocRef = 0x80,
    /// Push a reference to an argument. Operand: u16 index.
    LdArgRef = 0x81,
    /// Push a reference to a member (which must be a field). Operand: u32
    /// string token.
    LdMemRef = 0x82,
    /// Push a reference to an instance field. Operand: u32 field token.
    LdFldRef = 0x83,
    /// Push a reference to a static field. Operand: u32 field token.
    LdSFldRef = 0x84,
}

impl Opcode {
    /// The size of this opcode's operands in bytes, excluding the opcode
    /// byte itself. `Switch` reads a variable-length table after its fixed
    /// u16 count and is reported here as the fixed part only.
    pub fn operand_size(self) -> usize {
        match self {
            Opcode::Nop
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Ret
            | Opcode::RetNull
            | Opcode::LdArgc
            | Opcode::LdNull
            | Opcode::LdFalse
            | Opcode::LdTrue
            | Opcode::Apply
            | Opcode::LdIter
            | Opcode::LdType
            | Opcode::Eq
            | Opcode::Cmp
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Gt
            | Opcode::Gte
            | Opcode::Concat
            | Opcode::Throw
            | Opcode::Rethrow
            | Opcode::EndFinally => 0,

            Opcode::Operator => 1,

            Opcode::LdArg
            | Opcode::StArg
            | Opcode::LdLoc
            | Opcode::StLoc
            | Opcode::LdIdx
            | Opcode::StIdx
            | Opcode::LdLocRef
            | Opcode::LdArgRef
            | Opcode::Switch
            | Opcode::Call => 2,

            Opcode::LdStr
            | Opcode::List
            | Opcode::Hash
            | Opcode::LdSfn
            | Opcode::LdTypeTkn
            | Opcode::SApply
            | Opcode::LdFld
            | Opcode::StFld
            | Opcode::LdSFld
            | Opcode::StSFld
            | Opcode::LdMem
            | Opcode::StMem
            | Opcode::Br
            | Opcode::Leave
            | Opcode::BrNull
            | Opcode::BrInst
            | Opcode::BrFalse
            | Opcode::BrTrue
            | Opcode::BrRef
            | Opcode::BrNRef
            | Opcode::LdMemRef
            | Opcode::LdFldRef
            | Opcode::LdSFldRef => 4,

            Opcode::NewObj | Opcode::SCall | Opcode::CallMem => 6,

            Opcode::LdcI | Opcode::LdcU | Opcode::LdcR | Opcode::BrType => 8,

            Opcode::LdEnum => 12,
        }
    }
}
