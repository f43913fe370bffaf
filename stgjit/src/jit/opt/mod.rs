//! Trace-level optimisation passes: loop unrolling, dead-code elimination
//! and snapshot compaction.

use super::{
    ir::{
        irref_is_literal, snapshot::SnapEntry, IrBuffer, IrRef, IrType, Opcode, TRef, TyBits,
        INITIAL_BASE, REF_FIRST,
    },
    TraceError,
};
use std::collections::HashMap;

/// Peel one iteration of the loop.
///
/// Emits a `LOOP` marker, then replays every instruction recorded so far
/// with operand references substituted: a slot load replays as the value the
/// slot holds at the loop backedge, everything else as its re-emitted (and
/// re-folded) twin. Replayed guards carry substituted copies of their
/// original snapshots. Finally, every slot whose value differs between loop
/// entry and loop end gets a `PHI(entry, end)` node; the loop backedge moves
/// the end value into the entry value's location.
pub fn unroll_loop(buf: &mut IrBuffer) -> Result<(), TraceError> {
    let end = buf.bufmax();
    buf.emit_raw(Opcode::Loop, TyBits::plain(IrType::Void), 0, 0);
    // Heap regions do not fuse across the loop boundary.
    buf.last_heapchk = 0;
    // Replay without algebraic folding: reassociating a replayed
    // instruction onto pre-loop references would break the loop-carried
    // data flow the PHIs are about to pin down. CSE stays on so invariant
    // recomputations collapse back onto the first iteration.
    let saved_fold = buf.opts.fold;
    buf.opts.fold = false;
    let res = replay(buf, end);
    buf.opts.fold = saved_fold;
    let subst = res?;

    // PHI nodes for loop-carried slot values.
    let min = buf.slots.min_abs();
    let max = buf.slots.max_abs();
    let base = buf.slots.base_abs() as i32;
    let mut phis = Vec::new();
    for abs in min..=max {
        let t = buf.slots.get(abs as i32 - base);
        if t.is_none() || t.is_literal() {
            continue;
        }
        let lhs = t.ref_();
        let rhs = *subst.get(&lhs).unwrap_or(&lhs);
        if rhs != lhs {
            phis.push((lhs, rhs, t.ty()));
        }
    }
    for (lhs, rhs, ty) in phis {
        buf.emit_raw(Opcode::Phi, TyBits::plain(ty), lhs, rhs);
    }
    Ok(())
}

/// Replay the loop body `REF_FIRST..end` with reference substitution;
/// returns the substitution map (first-iteration ref -> twin).
fn replay(buf: &mut IrBuffer, end: IrRef) -> Result<HashMap<IrRef, IrRef>, TraceError> {
    let head_pc = buf.pc;
    let mut subst: HashMap<IrRef, IrRef> = HashMap::new();
    let lookup = |subst: &HashMap<IrRef, IrRef>, r: u16, is_ref: bool| -> u16 {
        if is_ref && !irref_is_literal(r) {
            *subst.get(&r).unwrap_or(&r)
        } else {
            r
        }
    };

    for r in REF_FIRST..end {
        let ins = *buf.ir(r);
        let op = ins.opcode();
        match op {
            Opcode::Nop | Opcode::Base | Opcode::Loop | Opcode::Phi => continue,
            Opcode::Sload => {
                // The second iteration reads what the first one left in the
                // slot.
                let slot = IrBuffer::sload_slot(&ins);
                let rel = slot + INITIAL_BASE as i32 - buf.slots.base_abs() as i32;
                let cur = buf.slots.get(rel);
                if !cur.is_none() && cur.ref_() != r {
                    subst.insert(r, cur.ref_());
                }
                continue;
            }
            Opcode::New => {
                let itbl = lookup(&subst, ins.op1(), true);
                let nfields = buf.heap.entry(ins.op2()).nfields();
                let fields: Vec<IrRef> = buf
                    .heap
                    .fields(ins.op2())
                    .iter()
                    .map(|&f| lookup(&subst, f, true))
                    .collect();
                let (t, entry) = buf.emit_new(TRef::new(itbl, IrType::Info), nfields);
                for (i, f) in fields.iter().enumerate() {
                    buf.set_field(entry, i as u16, TRef::new(*f, IrType::Unknown));
                }
                subst.insert(r, t.ref_());
                continue;
            }
            _ => {}
        }
        let (r1, r2) = op.ref_operands();
        let a = lookup(&subst, ins.op1(), r1);
        let b = lookup(&subst, ins.op2(), r2);
        if ins.is_guard() {
            // The substituted snapshot is pushed up front; the guard's own
            // snapshot capture then re-uses it.
            replay_snapshot(buf, r, &subst);
        }
        let t = buf.emit(op, ins.tybits(), a, b)?;
        if !t.is_none() {
            subst.insert(r, t.ref_());
        }
    }
    buf.pc = head_pc;
    Ok(subst)
}

/// Push a substituted copy of the snapshot the original guard at `r` owned.
fn replay_snapshot(buf: &mut IrBuffer, r: IrRef, subst: &HashMap<IrRef, IrRef>) {
    let Some(si) = buf.snap_for(r) else { return };
    let snap = buf.snaps[si].clone();
    let entries: Vec<SnapEntry> = buf.snapmap[snap.map_range()]
        .iter()
        .map(|e| {
            let nr = if irref_is_literal(e.ref_()) {
                e.ref_()
            } else {
                *subst.get(&e.ref_()).unwrap_or(&e.ref_())
            };
            SnapEntry::new(e.slot(), nr)
        })
        .collect();
    buf.pc = snap.pc();
    buf.push_snapshot(&entries, snap.relbase(), snap.framesize(), snap.pc());
}

/// Dead-code elimination.
///
/// Marks uses starting from the roots (guards, side effects, `SAVE`,
/// `PHI`s, snapshot entries and live allocations' fields) in one backward
/// pass, then turns every unmarked, effect-free instruction into a `NOP`.
/// Runs once before sink analysis (when every allocation's fields pin their
/// inputs) and once after it.
pub fn dead_code_elim(buf: &mut IrBuffer, _post_sink: bool) {
    let end = buf.bufmax();
    let n = (end - REF_FIRST) as usize;
    if n == 0 {
        return;
    }
    let idx = |r: IrRef| (r - REF_FIRST) as usize;
    let mut live = vec![false; n];

    let mark = |live: &mut Vec<bool>, r: IrRef| {
        if !irref_is_literal(r) && r >= REF_FIRST && r < end {
            live[idx(r)] = true;
        }
    };

    for r in (REF_FIRST..end).rev() {
        let ins = *buf.ir(r);
        let op = ins.opcode();
        let rooted = ins.is_guard()
            || op.has_side_effect()
            || matches!(op, Opcode::Loop | Opcode::Phi);
        if rooted {
            live[idx(r)] = true;
        }
        if !live[idx(r)] {
            continue;
        }
        let (r1, r2) = op.ref_operands();
        if r1 {
            mark(&mut live, ins.op1());
        }
        if r2 {
            mark(&mut live, ins.op2());
        }
        if op == Opcode::New {
            mark(&mut live, ins.op1());
            for &f in buf.heap.fields(ins.op2()).to_vec().iter() {
                mark(&mut live, f);
            }
        }
        if ins.is_guard() {
            if let Some(si) = buf.snap_for(r) {
                let range = buf.snaps[si].map_range();
                let refs: Vec<IrRef> = buf.snapmap[range].iter().map(|e| e.ref_()).collect();
                for e in refs {
                    mark(&mut live, e);
                    // A sunk allocation in a snapshot keeps its fields
                    // alive for materialisation at deopt.
                    if !irref_is_literal(e) && e < end && buf.ir(e).opcode() == Opcode::New {
                        let fs = buf.heap.fields(buf.ir(e).op2()).to_vec();
                        for f in fs {
                            mark(&mut live, f);
                        }
                        mark(&mut live, buf.ir(e).op1());
                    }
                }
            }
        }
    }

    // Sweep backwards so a dead user does not keep its operands alive.
    for r in REF_FIRST..end {
        if !live[idx(r)] {
            let ins = buf.ir_mut(r);
            *ins = super::ir::Ir::new(Opcode::Nop, TyBits::plain(IrType::Void), 0, 0);
        }
    }
}

/// Drop snapshot entries whose instruction has been eliminated.
pub fn compact_snapshots(buf: &mut IrBuffer) {
    let mut newmap: Vec<SnapEntry> = Vec::with_capacity(buf.snapmap.len());
    let end = buf.bufmax();
    for i in 0..buf.snaps.len() {
        let range = buf.snaps[i].map_range();
        let mapofs = newmap.len() as u32;
        for e in buf.snapmap[range].iter() {
            let r = e.ref_();
            let dead = !irref_is_literal(r)
                && r >= REF_FIRST
                && r < end
                && buf.ir(r).opcode() == Opcode::Nop;
            if !dead {
                newmap.push(*e);
            }
        }
        let nent = (newmap.len() as u32 - mapofs) as u16;
        buf.snaps[i].set_map(mapofs, nent);
    }
    buf.snapmap = newmap;
}

#[cfg(test)]
mod tests {
    use super::super::ir::tests::test_buffer;
    use super::*;

    #[test]
    fn dce_removes_unused_pure_instructions() {
        let (mut buf, _stack) = test_buffer();
        let x = buf.slot(0);
        let y = buf.slot(1);
        // Dead: never used by a guard, snapshot or side effect.
        let dead = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), y.ref_())
            .unwrap();
        // Live: guarded.
        let live = buf
            .emit(Opcode::Sub, TyBits::plain(IrType::I64), x.ref_(), y.ref_())
            .unwrap();
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(
            Opcode::Lt,
            TyBits::guarded(IrType::Void),
            live.ref_(),
            zero.ref_(),
        );
        dead_code_elim(&mut buf, false);
        assert_eq!(buf.ir(dead.ref_()).opcode(), Opcode::Nop);
        assert_eq!(buf.ir(live.ref_()).opcode(), Opcode::Sub);
        // Its operands stay live through the guard use.
        assert_eq!(buf.ir(x.ref_()).opcode(), Opcode::Sload);
    }

    #[test]
    fn dce_keeps_snapshot_references() {
        let (mut buf, _stack) = test_buffer();
        let x = buf.slot(0);
        let t = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), x.ref_())
            .unwrap();
        buf.set_slot(2, t);
        let zero = buf.literal(IrType::I64, 0);
        // The guard's snapshot captures slot 2 = t.
        buf.emit_raw(
            Opcode::Lt,
            TyBits::guarded(IrType::Void),
            x.ref_(),
            zero.ref_(),
        );
        dead_code_elim(&mut buf, false);
        assert_eq!(buf.ir(t.ref_()).opcode(), Opcode::Add);
    }

    #[test]
    fn dead_chains_fall_together() {
        let (mut buf, _stack) = test_buffer();
        let x = buf.slot(0);
        let a = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), x.ref_())
            .unwrap();
        let b = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), x.ref_())
            .unwrap();
        dead_code_elim(&mut buf, false);
        // b is dead, and a was only used by b.
        assert_eq!(buf.ir(b.ref_()).opcode(), Opcode::Nop);
        assert_eq!(buf.ir(a.ref_()).opcode(), Opcode::Nop);
    }

    #[test]
    fn snapshot_compaction_drops_dead_entries() {
        let (mut buf, _stack) = test_buffer();
        let x = buf.slot(0);
        let t = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), x.ref_())
            .unwrap();
        buf.set_slot(2, t);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(
            Opcode::Lt,
            TyBits::guarded(IrType::Void),
            x.ref_(),
            zero.ref_(),
        );
        // Manually kill the Add to simulate a pass deciding it is gone.
        let dead = t.ref_();
        *buf.ir_mut(dead) = super::super::ir::Ir::new(
            Opcode::Nop,
            TyBits::plain(IrType::Void),
            0,
            0,
        );
        let before = buf.snaps()[0].entries();
        assert_eq!(before, 1);
        compact_snapshots(&mut buf);
        assert_eq!(buf.snaps()[0].entries(), 0);
    }

    #[test]
    fn unroll_inserts_loop_and_phis() {
        // One iteration of: x += 5; y -= 1; guard(y > 0).
        let (mut buf, _stack) = test_buffer();
        let x = buf.slot(0);
        let y = buf.slot(1);
        let five = buf.literal(IrType::I64, 5);
        let one = buf.literal(IrType::I64, 1);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit(
            Opcode::Gt,
            TyBits::guarded(IrType::Void),
            y.ref_(),
            zero.ref_(),
        )
        .unwrap();
        let x1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), five.ref_())
            .unwrap();
        buf.set_slot(0, x1);
        let y1 = buf
            .emit(Opcode::Sub, TyBits::plain(IrType::I64), y.ref_(), one.ref_())
            .unwrap();
        buf.set_slot(1, y1);

        unroll_loop(&mut buf).unwrap();

        assert!(buf.nloop != 0);
        assert_eq!(buf.ir(buf.nloop).opcode(), Opcode::Loop);
        // Two loop-carried values, two PHIs.
        let mut phis = Vec::new();
        let mut r = buf.chain_head(Opcode::Phi);
        while r != 0 {
            phis.push((buf.ir(r).op1(), buf.ir(r).op2()));
            r = buf.ir(r).prev();
        }
        assert_eq!(phis.len(), 2);
        // Each PHI pairs a first-iteration value with its replayed twin,
        // and the twin lives after the LOOP marker.
        for (lhs, rhs) in &phis {
            assert!(*lhs < buf.nloop);
            assert!(*rhs > buf.nloop);
        }
        // The replayed guard got a snapshot too: one per guard instance.
        let guards = (REF_FIRST..buf.bufmax())
            .filter(|&r| buf.ir(r).is_guard())
            .count();
        assert_eq!(buf.snaps().len(), guards);
    }

    #[test]
    fn unroll_replay_reuses_invariants() {
        // z = a + b is loop-invariant: the replay folds back onto it.
        let (mut buf, _stack) = test_buffer();
        let a = buf.slot(0);
        let b = buf.slot(1);
        let z = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), b.ref_())
            .unwrap();
        buf.set_slot(2, z);
        unroll_loop(&mut buf).unwrap();
        // No PHI: slot 2 holds the same reference at entry and end.
        assert_eq!(buf.chain_head(Opcode::Phi), 0);
    }
}
