//! The abstract heap.
//!
//! Every `NEW` instruction gets exactly one heap entry recording its info
//! table and field references symbolically. Sink analysis then decides which
//! allocations never need to exist on the fast path: an allocation observed
//! only by snapshots (and by other sunk allocations) emits no code and is
//! materialised lazily during deoptimisation.

use super::{irref_is_literal, IrBuffer, IrRef, Opcode, REF_FIRST};

/// Index of an abstract heap entry; stored in the `NEW` instruction's second
/// operand.
pub type HeapEntryIdx = u16;

/// A symbolic allocation.
#[derive(Clone, Debug)]
pub struct HeapEntry {
    /// The info-table reference (a literal or an earlier instruction).
    itbl: IrRef,
    /// The `NEW` instruction this entry belongs to.
    ref_: IrRef,
    /// Start of the fields in the heap map.
    mapofs: u32,
    /// Number of payload fields.
    nfields: u16,
    /// Word offset of the object relative to the heap pointer after its
    /// group's heap-check bump (negative); assigned by
    /// [AbstractHeap::fix_offsets] for non-sunk entries.
    hp_offs: i32,
    /// Sinkable: no code is emitted, deoptimisation materialises it.
    sunk: bool,
    /// Strongly-connected component id from sink analysis.
    scc: u32,
}

impl HeapEntry {
    pub fn itbl(&self) -> IrRef {
        self.itbl
    }

    pub fn ref_(&self) -> IrRef {
        self.ref_
    }

    pub fn nfields(&self) -> u16 {
        self.nfields
    }

    pub fn hp_offs(&self) -> i32 {
        self.hp_offs
    }

    pub fn is_sunk(&self) -> bool {
        self.sunk
    }

    pub fn scc(&self) -> u32 {
        self.scc
    }

    /// Total object size in words, counting the header.
    pub fn size_words(&self) -> u32 {
        1 + self.nfields as u32
    }

    fn map_range(&self) -> std::ops::Range<usize> {
        self.mapofs as usize..self.mapofs as usize + self.nfields as usize
    }
}

#[derive(Clone, Default)]
pub struct AbstractHeap {
    entries: Vec<HeapEntry>,
    map: Vec<IrRef>,
}

impl AbstractHeap {
    pub fn new() -> Self {
        AbstractHeap::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: HeapEntryIdx) -> &HeapEntry {
        &self.entries[idx as usize]
    }

    pub fn entries(&self) -> &[HeapEntry] {
        &self.entries
    }

    /// The recorded field references of an entry.
    pub fn fields(&self, idx: HeapEntryIdx) -> &[IrRef] {
        &self.map[self.entries[idx as usize].map_range()]
    }

    pub(super) fn new_entry(
        &mut self,
        itbl: IrRef,
        new_ref: IrRef,
        nfields: u16,
    ) -> HeapEntryIdx {
        let mapofs = self.map.len() as u32;
        self.map.extend(std::iter::repeat(0).take(nfields as usize));
        self.entries.push(HeapEntry {
            itbl,
            ref_: new_ref,
            mapofs,
            nfields,
            hp_offs: 0,
            sunk: false,
            scc: u32::MAX,
        });
        (self.entries.len() - 1) as HeapEntryIdx
    }

    pub(super) fn set_field(&mut self, idx: HeapEntryIdx, i: u16, r: IrRef) {
        let e = &self.entries[idx as usize];
        debug_assert!(i < e.nfields);
        let at = e.mapofs as usize + i as usize;
        self.map[at] = r;
    }

    /// The heap entry owning a `NEW` reference, if any.
    pub fn entry_for(&self, new_ref: IrRef) -> Option<HeapEntryIdx> {
        self.entries
            .iter()
            .position(|e| e.ref_ == new_ref)
            .map(|i| i as HeapEntryIdx)
    }
}

impl IrBuffer {
    /// Sink analysis.
    ///
    /// Builds the references graph between allocations (an edge a -> b when
    /// a field of `a` refers to allocation `b`), condenses it into strongly
    /// connected components, and marks an allocation sinkable when it is
    /// only observed by guard snapshots and by other sunk allocations.
    ///
    /// References from a `SAVE` snapshot count as escapes: `SAVE` writes its
    /// slots back inside the compiled code, which needs a concrete pointer.
    pub fn heap_sccs(&mut self) {
        let n = self.heap.entries.len();
        if n == 0 {
            return;
        }

        // An allocation escapes if any instruction other than a NEW field
        // mention or a guard snapshot entry uses its reference.
        let mut escaped = vec![false; n];
        for r in REF_FIRST..self.bufmax() {
            let ins = *self.ir(r);
            if ins.opcode() == Opcode::New {
                continue;
            }
            let (r1, r2) = ins.opcode().ref_operands();
            for (is_ref, o) in [(r1, ins.op1()), (r2, ins.op2())] {
                if !is_ref || irref_is_literal(o) {
                    continue;
                }
                if let Some(e) = self.heap.entry_for(o) {
                    escaped[e as usize] = true;
                }
            }
        }
        // Slot state at the end of the trace is written back by SAVE.
        for snap in &self.snaps {
            let save_snap = self
                .insts
                .get((snap.ref_() - super::REF_BIAS) as usize)
                .map(|i| i.opcode() == Opcode::Save)
                .unwrap_or(false);
            if !save_snap {
                continue;
            }
            for e in &self.snapmap[snap.map_range()] {
                if let Some(h) = self.heap.entry_for(e.ref_()) {
                    escaped[h as usize] = true;
                }
            }
        }

        // Field edges between allocations.
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            for &f in self.heap.fields(i as HeapEntryIdx) {
                if f == 0 || irref_is_literal(f) {
                    continue;
                }
                if let Some(j) = self.heap.entry_for(f) {
                    edges[i].push(j as usize);
                }
            }
        }

        // Iterative Tarjan SCC.
        let sccs = tarjan(n, &edges);
        for (i, &scc) in sccs.iter().enumerate() {
            self.heap.entries[i].scc = scc;
        }

        // A materialised allocation needs concrete field values, so escape
        // status propagates along field edges to a fixpoint.
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..n {
                if !escaped[i] {
                    continue;
                }
                for &j in &edges[i] {
                    if !escaped[j] {
                        escaped[j] = true;
                        changed = true;
                    }
                }
            }
        }

        for i in 0..n {
            self.heap.entries[i].sunk = !escaped[i];
        }
    }

    /// Assign bump offsets to every non-sunk allocation.
    ///
    /// Allocations are grouped by their guarding `HEAPCHK`; the check bumps
    /// the heap register by the group's total, so each object's address is a
    /// negative offset from the bumped pointer. Sunk allocations are skipped
    /// and their reservation removed from the check.
    pub fn fix_heap_offsets(&mut self) {
        let mut check: Option<IrRef> = None;
        let mut group: Vec<HeapEntryIdx> = Vec::new();
        let mut finished: Vec<(IrRef, Vec<HeapEntryIdx>)> = Vec::new();
        for r in REF_FIRST..self.bufmax() {
            match self.ir(r).opcode() {
                Opcode::HeapChk => {
                    if let Some(c) = check.take() {
                        finished.push((c, std::mem::take(&mut group)));
                    }
                    check = Some(r);
                }
                Opcode::New => {
                    let idx = self.ir(r).op2();
                    if !self.heap.entry(idx).is_sunk() {
                        group.push(idx);
                    }
                }
                _ => {}
            }
        }
        if let Some(c) = check.take() {
            finished.push((c, group));
        }
        for (chk, group) in finished {
            let total: u32 = group
                .iter()
                .map(|&i| self.heap.entry(i).size_words())
                .sum();
            self.ir_mut(chk).set_op1(total as u16);
            let mut off = -(total as i32);
            for i in group {
                self.heap.entries[i as usize].hp_offs = off;
                off += self.heap.entry(i).size_words() as i32;
            }
        }
    }
}

/// Iterative Tarjan strongly-connected components; returns a component id
/// per node.
fn tarjan(n: usize, edges: &[Vec<usize>]) -> Vec<u32> {
    #[derive(Clone)]
    struct NodeState {
        index: u32,
        lowlink: u32,
        on_stack: bool,
    }
    const UNVISITED: u32 = u32::MAX;
    let mut state = vec![
        NodeState {
            index: UNVISITED,
            lowlink: 0,
            on_stack: false
        };
        n
    ];
    let mut scc = vec![0u32; n];
    let mut next_index = 0u32;
    let mut next_scc = 0u32;
    let mut stack: Vec<usize> = Vec::new();

    for root in 0..n {
        if state[root].index != UNVISITED {
            continue;
        }
        // Explicit DFS work list: (node, next edge position).
        let mut work: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(&mut (v, ref mut pos)) = work.last_mut() {
            if *pos == 0 {
                state[v].index = next_index;
                state[v].lowlink = next_index;
                next_index += 1;
                state[v].on_stack = true;
                stack.push(v);
            }
            if *pos < edges[v].len() {
                let w = edges[v][*pos];
                *pos += 1;
                if state[w].index == UNVISITED {
                    work.push((w, 0));
                } else if state[w].on_stack {
                    state[v].lowlink = state[v].lowlink.min(state[w].index);
                }
            } else {
                work.pop();
                if let Some(&(u, _)) = work.last() {
                    let vl = state[v].lowlink;
                    state[u].lowlink = state[u].lowlink.min(vl);
                }
                if state[v].lowlink == state[v].index {
                    loop {
                        let w = stack.pop().unwrap();
                        state[w].on_stack = false;
                        scc[w] = next_scc;
                        if w == v {
                            break;
                        }
                    }
                    next_scc += 1;
                }
            }
        }
    }
    scc
}
