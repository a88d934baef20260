//! The garbage collector and its collaborators.
//!
//! The collector itself is a non-moving mark-sweep over a handle-based
//! object heap. What the execution engine depends on is the cooperation
//! protocol: allocation, the safepoint request channel, the per-thread
//! cycle lock, and the root-set walk.

pub mod gc;
pub mod heap;
pub mod roots;
pub mod string_table;

pub use gc::{Gc, ThreadRequest, ThreadShared};
pub use heap::{HashKey, ObjectBody, ObjectHeap};
pub use roots::{RootSetVisitor, RootSetWalker};
pub use string_table::StringTable;
