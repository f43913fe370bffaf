//! A tracing JIT for a lazy functional bytecode VM.
//!
//! The interpreter (not part of this crate) executes closures compiled from a
//! lazy functional language. When a hot loop is detected the capability
//! switches into recording mode: each interpreted bytecode is shadowed into a
//! typed SSA-ish IR, guards specialise the trace on observed run-time values
//! (info tables, return addresses), and when the trace closes it is optimised,
//! register-allocated and assembled into native code. Guard failures
//! deoptimise back into the interpreter via snapshots.
//!
//! The crate is organised as the compilation pipeline:
//!
//!  * [hotcount] — per-PC decaying counters that trigger recording.
//!  * [vm] — the data model shared with the interpreter: bytecode encoding,
//!    info tables and closures, the thread stack.
//!  * [jit] — the trace recorder, IR buffer and optimiser, register
//!    allocator, x86-64 assembler and the fragment store / deoptimiser.

#![allow(clippy::new_without_default)]
#![allow(clippy::upper_case_acronyms)]

pub mod hotcount;
pub mod jit;
pub mod vm;

pub use hotcount::{HotCount, HotCounters};
pub use jit::{Jit, JitOpts, JitParams, RecordStatus};

use std::{env, sync::LazyLock};

static JITSTATE_DEBUG: LazyLock<bool> =
    LazyLock::new(|| env::var("STGJIT_PRINT_JITSTATE").is_ok());

/// Print select JIT events to stderr for testing/debugging purposes.
pub(crate) fn print_jit_state(state: &str) {
    if *JITSTATE_DEBUG {
        eprintln!("jit-state: {}", state);
    }
    log::debug!("jit-state: {}", state);
}
