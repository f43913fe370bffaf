//! The fold/CSE engine.
//!
//! [IrBuffer::emit] routes every optimised emission through [fold_emit],
//! whose contract is: the returned reference is *semantically equivalent* to
//! the requested operation. It may be a folded literal, an existing
//! instruction found over the per-opcode chain, or nothing at all for a
//! guard proven to hold. A guard proven to always fail aborts the recording.
//!
//! CSE never crosses a guard or a side effect, and loads are never forwarded
//! past a store to a possibly-aliasing location (any `UPDATE`).

use super::{IrBuffer, IrRef, Opcode, TRef, TyBits};
use crate::{jit::TraceError, vm::Word};

/// Emit with folding and CSE.
///
/// Algebraic folding and CSE gate independently: the loop unroller replays
/// the trace body with folding off (a reassociation there could rewire a
/// loop-carried value onto a pre-loop reference) while still CSE-ing
/// loop-invariant recomputations.
pub(super) fn fold_emit(
    buf: &mut IrBuffer,
    op: Opcode,
    t: TyBits,
    mut op1: u16,
    mut op2: u16,
) -> Result<TRef, TraceError> {
    if buf.opts.fold {
        // Commutative normalisation: a literal operand goes to the right.
        if op.is_commutative() && super::irref_is_literal(op1) && !super::irref_is_literal(op2)
        {
            std::mem::swap(&mut op1, &mut op2);
        }

        let (ref1, ref2) = op.ref_operands();
        let lit1 = ref1 && super::irref_is_literal(op1);
        let lit2 = ref2 && super::irref_is_literal(op2);

        if t.is_guard() && op.is_comparison() && lit1 && lit2 {
            // Both sides known: the guard either always holds (and
            // vanishes) or always fails (and the trace is useless).
            let l = buf.literal_value(op1, 0);
            let r = buf.literal_value(op2, 0);
            let signed = buf.ir(op1).ty().is_signed();
            return if eval_comparison(op, l, r, signed) {
                Ok(TRef::none())
            } else {
                Err(TraceError::KnownFailingGuard)
            };
        }

        if t.is_guard() && op == Opcode::EqInfo && lit1 && lit2 {
            return if buf.literal_value(op1, 0) == buf.literal_value(op2, 0) {
                Ok(TRef::none())
            } else {
                Err(TraceError::KnownFailingGuard)
            };
        }

        // A comparison guard between identical references is decided by
        // its operator alone.
        if t.is_guard() && op.is_comparison() && ref1 && ref2 && op1 == op2 {
            return if matches!(
                op,
                Opcode::Eq | Opcode::Le | Opcode::Ge | Opcode::Ule | Opcode::Uge
            ) {
                Ok(TRef::none())
            } else {
                Err(TraceError::KnownFailingGuard)
            };
        }

        // Arithmetic simplification.
        if let Some(res) = fold_arith(buf, op, t, op1, op2, lit1, lit2) {
            return Ok(res);
        }
    }

    // CSE over the opcode chain.
    if buf.opts.cse && op.is_cseable() {
        let limit = if op.is_load() {
            buf.cse_limit.max(buf.load_limit)
        } else {
            buf.cse_limit
        };
        let mut r = buf.chain_head(op);
        while r != 0 && r >= limit {
            let ins = buf.ir(r);
            if ins.op1() == op1 && ins.op2() == op2 && ins.tybits() == t {
                return Ok(TRef::new(r, t.ty()));
            }
            r = ins.prev();
        }
    }

    Ok(buf.emit_raw(op, t, op1, op2))
}

fn eval_comparison(op: Opcode, l: Word, r: Word, signed: bool) -> bool {
    let (sl, sr) = (l as i64, r as i64);
    let (ul, ur) = (l as u64, r as u64);
    match op {
        Opcode::Lt => {
            if signed {
                sl < sr
            } else {
                ul < ur
            }
        }
        Opcode::Ge => {
            if signed {
                sl >= sr
            } else {
                ul >= ur
            }
        }
        Opcode::Le => {
            if signed {
                sl <= sr
            } else {
                ul <= ur
            }
        }
        Opcode::Gt => {
            if signed {
                sl > sr
            } else {
                ul > ur
            }
        }
        Opcode::Ult => ul < ur,
        Opcode::Uge => ul >= ur,
        Opcode::Ule => ul <= ur,
        Opcode::Ugt => ul > ur,
        Opcode::Eq => l == r,
        Opcode::Ne => l != r,
        _ => unreachable!(),
    }
}

/// Algebraic rules. Returns `None` if no rule applied.
fn fold_arith(
    buf: &mut IrBuffer,
    op: Opcode,
    t: TyBits,
    op1: u16,
    op2: u16,
    lit1: bool,
    lit2: bool,
) -> Option<TRef> {
    let ty = t.ty();

    // Constant folding.
    if lit1 && lit2 {
        let l = buf.literal_value(op1, 0) as i64;
        let r = buf.literal_value(op2, 0) as i64;
        let v = match op {
            Opcode::Add => l.wrapping_add(r),
            Opcode::Sub => l.wrapping_sub(r),
            Opcode::Mul => l.wrapping_mul(r),
            Opcode::Div if r != 0 => l.wrapping_div(r),
            Opcode::Rem if r != 0 => l.wrapping_rem(r),
            Opcode::Band => l & r,
            Opcode::Bor => l | r,
            Opcode::Bxor => l ^ r,
            Opcode::Bshl => l.wrapping_shl(r as u32),
            Opcode::Bshr => ((l as u64).wrapping_shr(r as u32)) as i64,
            _ => return None,
        };
        return Some(buf.literal(ty, v as Word));
    }
    if lit1 && matches!(op, Opcode::Neg | Opcode::Bnot) {
        let l = buf.literal_value(op1, 0) as i64;
        let v = match op {
            Opcode::Neg => l.wrapping_neg(),
            _ => !l,
        };
        return Some(buf.literal(ty, v as Word));
    }

    match op {
        Opcode::Add => {
            // x + 0 => x
            if lit2 && buf.literal_value(op2, 0) == 0 {
                return Some(tref_of(buf, op1));
            }
            // (x + k1) + k2 => x + (k1 + k2)
            if lit2 && !super::irref_is_literal(op1) {
                let left = *buf.ir(op1);
                if left.opcode() == Opcode::Add && super::irref_is_literal(left.op2()) {
                    let k1 = buf.literal_value(left.op2(), 0) as i64;
                    let k2 = buf.literal_value(op2, 0) as i64;
                    let k = buf.literal(ty, k1.wrapping_add(k2) as Word);
                    return fold_emit(buf, Opcode::Add, t, left.op1(), k.ref_())
                        .ok();
                }
            }
            None
        }
        Opcode::Sub => {
            // x - x => 0
            if op1 == op2 {
                return Some(buf.literal(ty, 0));
            }
            if lit2 {
                let k = buf.literal_value(op2, 0) as i64;
                // x - 0 => x
                if k == 0 {
                    return Some(tref_of(buf, op1));
                }
                // x - k => x + (-k)
                let nk = buf.literal(ty, k.wrapping_neg() as Word);
                return fold_emit(buf, Opcode::Add, t, op1, nk.ref_()).ok();
            }
            // 0 - x => -x
            if lit1 && buf.literal_value(op1, 0) == 0 {
                return fold_emit(buf, Opcode::Neg, t, op2, 0).ok();
            }
            // (a - b) - a => -b
            if !super::irref_is_literal(op1) {
                let left = *buf.ir(op1);
                if left.opcode() == Opcode::Sub && left.op1() == op2 {
                    return fold_emit(buf, Opcode::Neg, t, left.op2(), 0).ok();
                }
            }
            None
        }
        Opcode::Neg | Opcode::Bnot => {
            // -(-x) => x, ~(~x) => x
            if !super::irref_is_literal(op1) {
                let inner = buf.ir(op1);
                if inner.opcode() == op {
                    return Some(tref_of(buf, inner.op1()));
                }
            }
            None
        }
        _ => None,
    }
}

fn tref_of(buf: &IrBuffer, r: IrRef) -> TRef {
    TRef::new(r, buf.ir(r).ty())
}
