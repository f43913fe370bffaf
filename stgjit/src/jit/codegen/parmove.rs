//! The parallel-assignment resolver.
//!
//! At a loop backedge (PHI moves) and when writing a snapshot's values
//! back, a set of `(source, destination)` pairs must be performed *as if
//! simultaneously*: a naive in-order sequence would clobber sources that are
//! still needed. The resolver orders the moves — leaves (destinations that
//! are no source) first — and breaks cycles either with a caller-provided
//! scratch register or, for pure register cycles, with exchanges.
//!
//! The output is an abstract move list; the backend lowers each op to one or
//! two instructions. Memory-to-memory copies are only produced when a
//! scratch register is available.

use super::Reg;
use thiserror::Error;

/// A value location: a register or a (1-based) spill slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Loc {
    Reg(Reg),
    Spill(u16),
}

/// One resolved step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MoveOp {
    /// `dst <- src`. Never memory-to-memory.
    Copy { dst: Loc, src: Loc },
    /// Exchange two registers.
    Swap { a: Reg, b: Reg },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParMoveError {
    #[error("memory-to-memory move requires a scratch register")]
    NeedScratch,
    #[error("duplicate destination in parallel assignment")]
    DuplicateDest,
}

/// Resolve a parallel assignment into a sequential move list.
///
/// `moves` holds `(dst, src)` pairs; destinations must be distinct.
/// `scratch`, when given, must be a register that is neither a source nor a
/// destination.
pub fn resolve(
    moves: &[(Loc, Loc)],
    scratch: Option<Reg>,
) -> Result<Vec<MoveOp>, ParMoveError> {
    let mut pending: Vec<(Loc, Loc)> = moves
        .iter()
        .copied()
        .filter(|(d, s)| d != s)
        .collect();
    for (i, (d, _)) in pending.iter().enumerate() {
        if pending.iter().skip(i + 1).any(|(d2, _)| d2 == d) {
            return Err(ParMoveError::DuplicateDest);
        }
    }

    let mut out = Vec::with_capacity(pending.len() + 2);
    let emit_copy = |out: &mut Vec<MoveOp>, dst: Loc, src: Loc| -> Result<(), ParMoveError> {
        match (dst, src) {
            (Loc::Spill(_), Loc::Spill(_)) => {
                let Some(s) = scratch else {
                    return Err(ParMoveError::NeedScratch);
                };
                out.push(MoveOp::Copy {
                    dst: Loc::Reg(s),
                    src,
                });
                out.push(MoveOp::Copy {
                    dst,
                    src: Loc::Reg(s),
                });
                Ok(())
            }
            _ => {
                out.push(MoveOp::Copy { dst, src });
                Ok(())
            }
        }
    };

    loop {
        // Cycle breaking can turn a move into an identity; drop those.
        pending.retain(|(d, s)| d != s);
        if pending.is_empty() {
            break;
        }
        // Emit every move whose destination is no longer read.
        let mut progressed = false;
        let mut i = 0;
        while i < pending.len() {
            let (dst, src) = pending[i];
            let dst_is_read = pending.iter().any(|&(_, s)| s == dst);
            if !dst_is_read {
                emit_copy(&mut out, dst, src)?;
                pending.swap_remove(i);
                progressed = true;
            } else {
                i += 1;
            }
        }
        if progressed || pending.is_empty() {
            continue;
        }

        // Only cycles remain. Break one: either park a source in the
        // scratch register, or exchange a register pair.
        if let Some(s) = scratch {
            let (_, src) = pending[0];
            out.push(MoveOp::Copy {
                dst: Loc::Reg(s),
                src,
            });
            for (_, ps) in pending.iter_mut() {
                if *ps == src {
                    *ps = Loc::Reg(s);
                }
            }
        } else {
            // Without scratch only pure register cycles can be broken.
            let (dst, src) = pending[0];
            let (Loc::Reg(a), Loc::Reg(b)) = (dst, src) else {
                return Err(ParMoveError::NeedScratch);
            };
            out.push(MoveOp::Swap { a, b });
            // The swap performs `a <- b`; every pending read of `a` now
            // finds its value in `b`.
            pending.swap_remove(0);
            for (_, ps) in pending.iter_mut() {
                if *ps == dst {
                    *ps = src;
                }
            }
        }
    }
    Ok(out)
}
