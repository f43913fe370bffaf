//! The VM data model the JIT shares with the interpreter.
//!
//! The interpreter dispatch loop, the bytecode loader and the garbage
//! collector live elsewhere; this module only defines the shapes they hand to
//! the trace recorder: the instruction encoding, info tables and closures,
//! and the thread stack.

pub mod bytecode;
pub mod closure;
pub mod thread;

/// A machine word. Stack slots, heap words and closure payloads are all
/// untyped words; interpretation is up to the info table describing them.
pub type Word = usize;

/// A machine word, interpreted as a signed integer.
pub type WordInt = isize;

/// The size of a machine word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();
