//! Restoring interpreter state at a trace exit.
//!
//! Given the [ExitState] the common exit tail captured, the exit's snapshot
//! is replayed onto the concrete stack: every live slot is materialised from
//! its register home, its spill slot or the literal table, and sunk
//! allocations are built on the heap (recursively, tolerating cyclic
//! structures). `SAVE` exits skip the slot writes — the trace already wrote
//! them — and only reposition the interpreter.

use super::super::{RID_BASE, RID_HP};
use super::ExitState;
use crate::{
    jit::{
        fragment::{Fragment, TraceId},
        ir::{irref_is_literal, snapshot::SnapNo, Opcode, RID_NONE, SAVE_FALLTHROUGH, SAVE_LINK},
        JitOpts, JitParams,
    },
    vm::{
        bytecode::BcIns,
        thread::{Capability, Thread},
        Word, WORD_SIZE,
    },
};
use std::collections::HashMap;

/// What the exit handler decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Hand control back to the interpreter at the restored PC.
    Interpret,
    /// Transfer into another compiled fragment (trace link or compiled
    /// side trace).
    Link(TraceId),
    /// This guard exit became hot: record a side trace from here.
    StartSide { parent: TraceId, exit: SnapNo },
    /// A fall-through exit became hot: record a continuation root trace.
    StartFallthrough {
        parent: TraceId,
        exit: SnapNo,
        is_return: bool,
    },
}

/// Rebuild the concrete interpreter state for `exit` and decide what to do
/// next.
pub(crate) fn restore_snapshot(
    frag: &Fragment,
    exit: u32,
    es: &ExitState,
    thread: &mut Thread,
    cap: &mut Capability,
    opts: &JitOpts,
    params: &JitParams,
) -> ExitDisposition {
    let snap = frag.snap(exit);
    let ins = *frag.ir(snap.ref_());
    let op = ins.opcode();
    let entry_base = es.gpr[RID_BASE as usize] as *mut Word;

    // Publish the heap cursor back to the capability first; sunk
    // allocations are materialised at it.
    cap.trace_exit_hp = es.gpr[RID_HP as usize];
    cap.trace_exit_hplim = es.hplim;

    if op != Opcode::Save {
        let mut materialised: HashMap<u16, Word> = HashMap::new();
        for e in frag.snap_entries(exit) {
            let v = materialise(frag, e.ref_(), es, entry_base as Word, cap, &mut materialised);
            unsafe {
                *entry_base.offset(e.slot() as isize) = v;
            }
        }
    }

    // Reposition the interpreter: the virtual base may have moved relative
    // to the trace entry.
    let base = unsafe { entry_base.offset(snap.relbase() as isize) };
    thread.set_base_from_addr(base as Word);
    thread.set_framesize(snap.framesize() as usize);
    thread.set_pc(snap.pc() as *const BcIns);

    if op == Opcode::HeapChk {
        // The check bumped the heap register before failing; undo it.
        cap.trace_exit_hp -= ins.op1() as Word * WORD_SIZE;
    }

    // A compiled continuation takes priority over everything else.
    if let Some(target) = frag.exit_link(exit) {
        return ExitDisposition::Link(target);
    }
    if op == Opcode::Save && ins.op1() == SAVE_LINK {
        return ExitDisposition::Link(TraceId::from_u16(ins.op2()));
    }

    if op != Opcode::HeapChk && opts.enable_side_traces {
        let count = frag.bump_exit_counter(exit);
        if count == params.exit_threshold {
            if op == Opcode::Save && ins.op1() == SAVE_FALLTHROUGH {
                let pc = snap.pc() as *const BcIns;
                let is_return = {
                    let head = unsafe { *pc };
                    !head.opcode().is_func_header()
                };
                return ExitDisposition::StartFallthrough {
                    parent: frag.id(),
                    exit,
                    is_return,
                };
            }
            if op != Opcode::Save {
                return ExitDisposition::StartSide {
                    parent: frag.id(),
                    exit,
                };
            }
        }
    }

    ExitDisposition::Interpret
}

/// The concrete value of a snapshot reference: a literal, a sunk
/// allocation (built on the heap now) or the content of the assigned
/// register or spill slot.
fn materialise(
    frag: &Fragment,
    r: u16,
    es: &ExitState,
    entry_base: Word,
    cap: &mut Capability,
    materialised: &mut HashMap<u16, Word>,
) -> Word {
    if irref_is_literal(r) {
        return frag.literal_value(r, entry_base);
    }
    let ins = frag.ir(r);
    if ins.opcode() == Opcode::New {
        let e = ins.op2();
        if frag.heap.entry(e).is_sunk() {
            if let Some(&addr) = materialised.get(&r) {
                return addr;
            }
            let addr = cap.trace_exit_hp;
            cap.trace_exit_hp += frag.heap.entry(e).size_words() as Word * WORD_SIZE;
            // Claim the address before filling fields so cyclic structures
            // terminate.
            materialised.insert(r, addr);
            let itbl = materialise(frag, frag.heap.entry(e).itbl(), es, entry_base, cap, materialised);
            unsafe {
                *(addr as *mut Word) = itbl;
            }
            let fields: Vec<u16> = frag.heap.fields(e).to_vec();
            for (i, f) in fields.iter().enumerate() {
                let v = materialise(frag, *f, es, entry_base, cap, materialised);
                unsafe {
                    *(addr as *mut Word).add(1 + i) = v;
                }
            }
            return addr;
        }
    }
    if ins.reg() != RID_NONE {
        es.gpr[ins.reg() as usize]
    } else if ins.spill() != 0 {
        es.spill[ins.spill() as usize - 1]
    } else {
        // A snapshot never references a value without a home; the
        // allocator walks the same liveness the snapshot defines.
        debug_assert!(false, "snapshot reference without a home");
        0
    }
}
