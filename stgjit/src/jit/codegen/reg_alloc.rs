//! Home assignment: a backward linear scan over the IR.
//!
//! The walk starts at the last instruction (last use first). A reference
//! gets a home the first time it is seen as an operand — a register while
//! one is free, otherwise a register is taken from the currently live
//! reference with the highest number, which is demoted to a fresh spill
//! slot for its whole range. A reference's home is released at its
//! definition. Literals are never allocated: they can always be
//! rematerialised.
//!
//! Because assignment is a pre-pass and emission runs forward afterwards,
//! an eviction is a pure re-assignment; no spill code is placed here. The
//! emitter reads and writes homes, and the deoptimiser reads the same
//! assignments out of the frozen IR.

use super::{GPR_HOMES, RegSet};
use crate::jit::{
    ir::{irref_is_literal, IrBuffer, IrRef, Opcode, RID_NONE, REF_FIRST},
    CompilationError,
};

/// The result of allocation; the emitter sizes the spill area from it.
pub struct AllocInfo {
    pub nspills: u32,
}

/// The largest spill slot number (spill numbers are 1-based bytes).
pub const MAX_SPILLS: u32 = 255;

/// Call `f` for every IR reference the instruction at `r` uses, including
/// allocation fields and the live references of a guard's snapshot. Sunk
/// allocations contribute their fields (materialised at deopt) instead of
/// themselves.
pub(crate) fn for_each_use<F: FnMut(IrRef)>(buf: &IrBuffer, r: IrRef, f: &mut F) {
    let ins = buf.ir(r);
    let op = ins.opcode();
    let (r1, r2) = op.ref_operands();
    let mut use_ref = |u: IrRef, f: &mut F| {
        if !irref_is_literal(u) && u >= REF_FIRST {
            f(u);
        }
    };
    if r1 {
        use_ref(ins.op1(), f);
    }
    if r2 {
        use_ref(ins.op2(), f);
    }
    if op == Opcode::New {
        let entry = ins.op2();
        if !buf.heap.entry(entry).is_sunk() {
            use_ref(ins.op1(), f);
            for &fld in buf.heap.fields(entry) {
                use_ref(fld, f);
            }
        }
    }
    if ins.is_guard() {
        if let Some(si) = buf.snap_for(r) {
            let range = buf.snaps()[si].map_range();
            for e in &buf.snapmap()[range] {
                snapshot_use(buf, e.ref_(), f);
            }
        }
    }
}

fn snapshot_use<F: FnMut(IrRef)>(buf: &IrBuffer, u: IrRef, f: &mut F) {
    if irref_is_literal(u) || u < REF_FIRST {
        return;
    }
    let ins = buf.ir(u);
    if ins.opcode() == Opcode::New && buf.heap.entry(ins.op2()).is_sunk() {
        // The object does not exist on the fast path; its fields do.
        let mut seen = Vec::new();
        use_sunk_fields(buf, ins.op2(), f, &mut seen);
    } else {
        f(u);
    }
}

fn use_sunk_fields<F: FnMut(IrRef)>(buf: &IrBuffer, entry: u16, f: &mut F, seen: &mut Vec<u16>) {
    if seen.contains(&entry) {
        return;
    }
    seen.push(entry);
    for &fld in buf.heap.fields(entry).to_vec().iter() {
        if irref_is_literal(fld) || fld < REF_FIRST {
            continue;
        }
        let fins = buf.ir(fld);
        if fins.opcode() == Opcode::New && buf.heap.entry(fins.op2()).is_sunk() {
            use_sunk_fields(buf, fins.op2(), f, seen);
        } else {
            f(fld);
        }
    }
}

struct AllocState {
    free: RegSet,
    /// References currently holding a register.
    live: Vec<IrRef>,
    next_spill: u32,
}

fn ensure_home(
    buf: &mut IrBuffer,
    st: &mut AllocState,
    u: IrRef,
) -> Result<(), CompilationError> {
    if buf.ir(u).has_home() {
        return Ok(());
    }
    if let Some(reg) = st.free.pick_bot() {
        st.free.remove(reg);
        buf.ir_mut(u).set_reg(reg);
        st.live.push(u);
        return Ok(());
    }
    // No free register: demote the highest-numbered live reference to a
    // spill slot and take its register.
    let (vi, &victim) = st
        .live
        .iter()
        .enumerate()
        .max_by_key(|(_, &l)| l)
        .expect("no free register and nothing live");
    let vreg = buf.ir(victim).reg();
    debug_assert!(vreg != RID_NONE);
    if st.next_spill > MAX_SPILLS {
        return Err(CompilationError::LimitExceeded("out of spill slots".into()));
    }
    buf.ir_mut(victim).set_reg(RID_NONE);
    buf.ir_mut(victim).set_spill(st.next_spill as u8);
    st.next_spill += 1;
    st.live.remove(vi);
    buf.ir_mut(u).set_reg(vreg);
    st.live.push(u);
    Ok(())
}

/// Assign a home to every live reference; see the module docs.
pub fn allocate(buf: &mut IrBuffer) -> Result<AllocInfo, CompilationError> {
    let end = buf.bufmax();
    for r in REF_FIRST..end {
        buf.ir_mut(r).init_home();
    }

    let mut st = AllocState {
        free: GPR_HOMES,
        live: Vec::new(),
        next_spill: 1,
    };

    // Linear liveness does not see the loop backedge: a reference defined
    // before `LOOP` and read inside the loop body is read again on every
    // iteration, so its range extends to the end of the trace. Pin such
    // references up front.
    if buf.nloop != 0 {
        let mut cross: Vec<IrRef> = Vec::new();
        for r in buf.nloop..end {
            for_each_use(buf, r, &mut |u| {
                if u < buf.nloop && !cross.contains(&u) {
                    cross.push(u);
                }
            });
        }
        for u in cross {
            ensure_home(buf, &mut st, u)?;
        }
    }

    for r in (REF_FIRST..end).rev() {
        // Definition point: release the home.
        let reg = buf.ir(r).reg();
        if reg != RID_NONE {
            st.free.insert(reg);
            st.live.retain(|&l| l != r);
        }

        let mut uses: Vec<IrRef> = Vec::new();
        for_each_use(buf, r, &mut |u| uses.push(u));
        for u in uses {
            ensure_home(buf, &mut st, u)?;
        }
    }

    Ok(AllocInfo {
        nspills: st.next_spill - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{tests::test_buffer, IrType, TyBits, RID_NONE};
    use std::collections::HashMap;

    /// The last use site of every reference (for interval checking).
    fn last_uses(buf: &IrBuffer) -> HashMap<IrRef, IrRef> {
        let mut last = HashMap::new();
        for r in REF_FIRST..buf.bufmax() {
            for_each_use(buf, r, &mut |u| {
                last.insert(u, r);
            });
        }
        last
    }

    fn assert_alloc_invariants(buf: &IrBuffer) {
        let last = last_uses(buf);
        let mut spills = Vec::new();
        let refs: Vec<IrRef> = (REF_FIRST..buf.bufmax())
            .filter(|&r| buf.ir(r).has_home())
            .collect();
        for &a in &refs {
            if buf.ir(a).spill() != 0 {
                spills.push(buf.ir(a).spill());
            }
            for &b in &refs {
                if a >= b {
                    continue;
                }
                let (ra, rb) = (buf.ir(a).reg(), buf.ir(b).reg());
                if ra == RID_NONE || ra != rb {
                    continue;
                }
                // Same register: live ranges must not overlap. Range of x
                // is [x, last_use(x)].
                let ea = last[&a];
                assert!(
                    ea <= b,
                    "refs {:04x} and {:04x} share r{} with overlapping ranges",
                    a,
                    b,
                    ra
                );
            }
        }
        // Spill slots are never reused.
        let n = spills.len();
        spills.sort_unstable();
        spills.dedup();
        assert_eq!(spills.len(), n);
    }

    #[test]
    fn simple_allocation_uses_registers() {
        let (mut buf, _stack) = test_buffer();
        buf.opts.fold = false;
        let a = buf.slot(0);
        let k = buf.literal(IrType::I64, 1234);
        let t1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), k.ref_())
            .unwrap();
        let t2 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), t1.ref_(), k.ref_())
            .unwrap();
        buf.set_slot(0, t2);
        buf.set_slot(1, t2);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            crate::jit::ir::SAVE_FALLTHROUGH,
            0,
        );
        let info = allocate(&mut buf).unwrap();
        assert_eq!(info.nspills, 0);
        // The literal is never allocated.
        assert!(!buf.ir(k.ref_()).has_home());
        assert!(buf.ir(t2.ref_()).reg() != RID_NONE);
        assert!(buf.ir(a.ref_()).reg() != RID_NONE);
        assert_alloc_invariants(&buf);
    }

    #[test]
    fn pressure_spills_by_highest_reference() {
        let (mut buf, _stack) = test_buffer();
        buf.opts.fold = false;
        // More simultaneously-live values than home registers.
        let mut vals = Vec::new();
        for i in 0..12 {
            vals.push(buf.slot(i));
        }
        let mut acc = vals[0];
        for v in &vals[1..] {
            acc = buf
                .emit(Opcode::Add, TyBits::plain(IrType::I64), acc.ref_(), v.ref_())
                .unwrap();
        }
        for (i, v) in vals.iter().enumerate() {
            buf.set_slot(i as i32, *v);
        }
        buf.set_slot(12, acc);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            crate::jit::ir::SAVE_FALLTHROUGH,
            0,
        );
        let info = allocate(&mut buf).unwrap();
        assert!(info.nspills > 0);
        assert_alloc_invariants(&buf);
        // Everything the snapshot needs has a home somewhere.
        for v in &vals {
            assert!(buf.ir(v.ref_()).has_home());
        }
    }

    #[test]
    fn dead_values_get_no_home() {
        let (mut buf, _stack) = test_buffer();
        buf.opts.fold = false;
        let a = buf.slot(0);
        let dead = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), a.ref_())
            .unwrap();
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            crate::jit::ir::SAVE_FALLTHROUGH,
            0,
        );
        allocate(&mut buf).unwrap();
        assert!(!buf.ir(dead.ref_()).has_home());
    }

    #[test]
    fn sunk_allocation_fields_stay_live() {
        let (mut buf, _stack) = test_buffer();
        let itbl = buf.literal(IrType::Info, 0x1234);
        let x = buf.slot(0);
        buf.emit_heap_check(3).unwrap();
        let (cell, e) = buf.emit_new(itbl, 2);
        buf.set_field(e, 0, x);
        buf.set_field(e, 1, x);
        buf.set_slot(1, cell);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(
            Opcode::Lt,
            TyBits::guarded(IrType::Void),
            x.ref_(),
            zero.ref_(),
        );
        buf.heap_sccs();
        assert!(buf.heap.entry(e).is_sunk());
        allocate(&mut buf).unwrap();
        // The sunk NEW has no runtime value; its field does.
        assert!(!buf.ir(cell.ref_()).has_home());
        assert!(buf.ir(x.ref_()).has_home());
    }
}
