//! Snapshots.
//!
//! Every guard captures the abstract interpreter state just before it: the
//! live written slots, the bytecode PC to resume at, the virtual base's
//! delta from the trace entry base, and the frame size. At guard failure the
//! deoptimiser replays the snapshot onto the concrete stack.
//!
//! Snapshots are immutable after emission. Taking a snapshot when nothing
//! changed since the previous one (no instruction emitted, no slot written,
//! same PC) re-uses it, so back-to-back guards share a snapshot object.

use super::{IrBuffer, IrRef, INITIAL_BASE};
use crate::vm::Word;

/// A snapshot number; doubles as the trace exit number.
pub type SnapNo = u32;

/// One `(slot, ref)` pair, packed. The slot index is relative to the trace
/// entry base and may be negative (frames below the entry frame).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SnapEntry(u32);

impl SnapEntry {
    pub fn new(slot: i16, r: IrRef) -> Self {
        SnapEntry(((slot as u16 as u32) << 16) | r as u32)
    }

    pub fn slot(self) -> i16 {
        (self.0 >> 16) as u16 as i16
    }

    pub fn ref_(self) -> IrRef {
        (self.0 & 0xffff) as IrRef
    }
}

impl std::fmt::Debug for SnapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]={}", self.slot(), super::fmt_ref(self.ref_()))
    }
}

/// A snapshot of the abstract state at one IR reference.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// The reference of the guard this snapshot belongs to (the next
    /// instruction at capture time).
    ref_: IrRef,
    /// Start offset into the snapshot map.
    mapofs: u32,
    /// Number of entries.
    nent: u16,
    /// The virtual base's word delta from the trace entry base.
    relbase: i32,
    /// Frame size (top - base) at the snapshot point.
    framesize: u16,
    /// Bytecode PC to resume at.
    pc: Word,
}

impl Snapshot {
    pub fn ref_(&self) -> IrRef {
        self.ref_
    }

    pub fn entries(&self) -> u16 {
        self.nent
    }

    pub fn relbase(&self) -> i32 {
        self.relbase
    }

    pub fn framesize(&self) -> u16 {
        self.framesize
    }

    pub fn pc(&self) -> Word {
        self.pc
    }

    pub fn map_range(&self) -> std::ops::Range<usize> {
        self.mapofs as usize..self.mapofs as usize + self.nent as usize
    }

    /// Repoint this snapshot's entries (snapshot compaction only).
    pub(crate) fn set_map(&mut self, mapofs: u32, nent: u16) {
        self.mapofs = mapofs;
        self.nent = nent;
    }

    /// The captured reference for an entry-base-relative slot, or 0.
    pub fn slot_ref(&self, map: &[SnapEntry], slot: i16) -> IrRef {
        map[self.map_range()]
            .iter()
            .find(|e| e.slot() == slot)
            .map(|e| e.ref_())
            .unwrap_or(0)
    }
}

impl IrBuffer {
    /// Capture (or re-use) a snapshot of the current abstract state.
    pub fn snapshot(&mut self) -> SnapNo {
        let next_ref = self.bufmax();
        if let Some(last) = self.snaps.last() {
            if !self.slots_modified && last.ref_ == next_ref && last.pc == self.pc {
                return (self.snaps.len() - 1) as SnapNo;
            }
        }
        let mapofs = self.snapmap.len() as u32;
        let min = self.slots.min_abs();
        let max = self.slots.max_abs();
        for abs in min..=max {
            let t = self.slots.get(abs as i32 - self.slots.base_abs() as i32);
            if t.is_none() || !t.is_written() {
                continue;
            }
            let slot = abs as i32 - INITIAL_BASE as i32;
            self.snapmap
                .push(SnapEntry::new(slot as i16, t.ref_()));
        }
        let nent = (self.snapmap.len() as u32 - mapofs) as u16;
        let snap = Snapshot {
            ref_: next_ref,
            mapofs,
            nent,
            relbase: self.slots.relbase(),
            framesize: self.slots.top_slot() as u16,
            pc: self.pc,
        };
        self.snaps.push(snap);
        self.slots_modified = false;
        (self.snaps.len() - 1) as SnapNo
    }

    /// Push a pre-built snapshot (used when replaying a loop body, where
    /// entries are substituted rather than captured from the slots).
    pub(crate) fn push_snapshot(
        &mut self,
        entries: &[SnapEntry],
        relbase: i32,
        framesize: u16,
        pc: Word,
    ) {
        let mapofs = self.snapmap.len() as u32;
        self.snapmap.extend_from_slice(entries);
        self.snaps.push(Snapshot {
            ref_: self.bufmax(),
            mapofs,
            nent: entries.len() as u16,
            relbase,
            framesize,
            pc,
        });
        self.slots_modified = false;
    }

    pub fn snapmap(&self) -> &[SnapEntry] {
        &self.snapmap
    }
}
