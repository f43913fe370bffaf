//! The fragment store.
//!
//! A fragment is a compiled trace: the frozen IR buffer (with register and
//! spill assignments in place), the snapshot table, the abstract heap, the
//! machine code, and per-exit counters and links. Fragments live for the
//! process lifetime and are addressed by numeric trace ids everywhere —
//! parents point at children and children at parents only through the
//! store, which keeps the ownership graph acyclic.

use super::{
    codegen::x86_64::CompiledCode,
    ir::{
        literal_value_in,
        snapshot::{SnapEntry, SnapNo, Snapshot},
        heap::AbstractHeap,
        Ir, IrBuffer, IrRef, REF_BIAS,
    },
    TraceType,
};
use crate::vm::Word;
use indexmap::IndexMap;
use std::cell::Cell;
use typed_index_collections::TiVec;

/// A trace id: the fragment's index in the store. Small enough to embed in
/// a `JFUNC`/`JRET` instruction's D operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(u16);

impl TraceId {
    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn from_u16(v: u16) -> Self {
        TraceId(v)
    }
}

impl From<usize> for TraceId {
    fn from(v: usize) -> Self {
        TraceId(u16::try_from(v).expect("fragment table full"))
    }
}

impl From<TraceId> for usize {
    fn from(v: TraceId) -> usize {
        v.0 as usize
    }
}

/// Sentinel for "no linked trace" in the per-exit link table.
const NO_LINK: u16 = u16::MAX;

pub struct Fragment {
    id: TraceId,
    start_pc: Word,
    parent: Option<(TraceId, SnapNo)>,
    trace_type: TraceType,
    is_return: bool,
    /// Frozen literal region (index 0 is `REF_BIAS - 1`).
    consts: Vec<Ir>,
    /// Frozen instruction region (index 0 is `REF_BIAS`, the BASE marker).
    insts: Vec<Ir>,
    kwords: Vec<Word>,
    snaps: Vec<Snapshot>,
    snapmap: Vec<SnapEntry>,
    pub(crate) heap: AbstractHeap,
    /// Highest stack slot the trace touches, relative to the entry base.
    frame_size: u16,
    code: Option<CompiledCode>,
    /// Per-exit hotness counters (side-trace triggering).
    exit_counts: Vec<Cell<u8>>,
    /// Per-exit linked trace: a compiled side trace or fall-through
    /// continuation entered instead of deoptimising.
    links: Vec<Cell<u16>>,
}

impl Fragment {
    pub(crate) fn from_buffer(
        id: TraceId,
        buf: &IrBuffer,
        start_pc: Word,
        parent: Option<(TraceId, SnapNo)>,
        trace_type: TraceType,
        is_return: bool,
        code: Option<CompiledCode>,
    ) -> Self {
        let nsnaps = buf.snaps().len();
        Fragment {
            id,
            start_pc,
            parent,
            trace_type,
            is_return,
            consts: buf.consts_slice().to_vec(),
            insts: buf.insts_slice().to_vec(),
            kwords: buf.kwords().to_vec(),
            snaps: buf.snaps().to_vec(),
            snapmap: buf.snapmap().to_vec(),
            heap: buf.heap.clone(),
            frame_size: buf.slots.highest_slot(),
            code,
            exit_counts: vec![Cell::new(0); nsnaps],
            links: vec![Cell::new(NO_LINK); nsnaps],
        }
    }

    pub fn id(&self) -> TraceId {
        self.id
    }

    pub fn start_pc(&self) -> Word {
        self.start_pc
    }

    pub fn parent(&self) -> Option<(TraceId, SnapNo)> {
        self.parent
    }

    pub fn trace_type(&self) -> TraceType {
        self.trace_type
    }

    pub fn is_return(&self) -> bool {
        self.is_return
    }

    pub fn frame_size(&self) -> u16 {
        self.frame_size
    }

    pub fn code(&self) -> Option<&CompiledCode> {
        self.code.as_ref()
    }

    pub fn ir(&self, r: IrRef) -> &Ir {
        if r >= REF_BIAS {
            &self.insts[(r - REF_BIAS) as usize]
        } else {
            &self.consts[(REF_BIAS - 1 - r) as usize]
        }
    }

    pub fn last_ins(&self) -> &Ir {
        self.insts.last().unwrap()
    }

    pub fn num_exits(&self) -> usize {
        self.snaps.len()
    }

    pub fn snap(&self, n: SnapNo) -> &Snapshot {
        &self.snaps[n as usize]
    }

    pub fn snap_entries(&self, n: SnapNo) -> &[SnapEntry] {
        &self.snapmap[self.snaps[n as usize].map_range()]
    }

    pub fn literal_value(&self, r: IrRef, base: Word) -> Word {
        literal_value_in(self.ir(r), &self.kwords, base)
    }

    /// Bump the exit counter; returns the new count (saturating).
    pub fn bump_exit_counter(&self, n: SnapNo) -> u8 {
        let c = &self.exit_counts[n as usize];
        let v = c.get().saturating_add(1);
        c.set(v);
        v
    }

    pub fn exit_count(&self, n: SnapNo) -> u8 {
        self.exit_counts[n as usize].get()
    }

    /// Link a compiled trace to one of this fragment's exits.
    pub fn link_exit(&self, n: SnapNo, target: TraceId) {
        self.links[n as usize].set(target.as_u16());
    }

    pub fn exit_link(&self, n: SnapNo) -> Option<TraceId> {
        let v = self.links[n as usize].get();
        if v == NO_LINK {
            None
        } else {
            Some(TraceId(v))
        }
    }
}

/// The append-only fragment table plus the root-trace dispatch map.
pub struct FragmentStore {
    frags: TiVec<TraceId, Fragment>,
    /// `start_pc >> 2` -> trace id, for root traces only.
    by_pc: IndexMap<Word, TraceId>,
}

impl FragmentStore {
    pub fn new() -> Self {
        FragmentStore {
            frags: TiVec::new(),
            by_pc: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.frags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    pub fn next_id(&self) -> TraceId {
        TraceId::from(self.frags.len())
    }

    /// Register a completed fragment. Side traces are reachable only via
    /// their parent's exit links, not the dispatch map.
    pub fn register(&mut self, frag: Fragment, is_side: bool) -> TraceId {
        let id = frag.id();
        debug_assert_eq!(id, self.next_id());
        if !is_side {
            self.by_pc.insert(frag.start_pc() >> 2, id);
        }
        self.frags.push(frag);
        id
    }

    pub fn lookup(&self, pc: Word) -> Option<TraceId> {
        self.by_pc.get(&(pc >> 2)).copied()
    }
}

impl std::ops::Index<TraceId> for FragmentStore {
    type Output = Fragment;

    fn index(&self, id: TraceId) -> &Fragment {
        &self.frags[id]
    }
}

impl std::ops::IndexMut<TraceId> for FragmentStore {
    fn index_mut(&mut self, id: TraceId) -> &mut Fragment {
        &mut self.frags[id]
    }
}
