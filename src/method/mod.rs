//! The method-initialization pipeline.
//!
//! A bytecode method reaches the interpreter uninitialized. On first
//! invocation the pipeline here rewrites its source instruction stream into
//! the internal, operand-resolved form:
//!
//! 1. [`parser::MethodParser`] decodes the source stream, resolves and
//!    validates tokens, and translates branch, try-block and debug-symbol
//!    offsets into instruction indices.
//! 2. [`analyzer::StackAnalyzer`] runs the path-sensitive stack-height
//!    analysis, enforcing the reference rules and deriving call reference
//!    signatures while [`initializer::MethodInitializer`] folds redundant
//!    moves and fuses compare-and-branch pairs.
//! 3. [`builder::MethodBuilder`] compacts the instruction list, rewrites all
//!    targets, and the instructions serialize themselves into a
//!    [`buffer::MethodBuffer`], which becomes the method's executable body.

pub mod analyzer;
pub mod buffer;
pub mod builder;
pub mod initializer;
pub mod instructions;
pub mod parser;

pub use buffer::MethodBuffer;
pub use builder::MethodBuilder;
pub use initializer::MethodInitializer;
