//! The trace recorder.
//!
//! While a capability is in recording mode, the interpreter calls
//! [Jit::record_ins] before executing each bytecode. The recorder shadows
//! the instruction into the IR buffer, specialising on the run-time values
//! it observes: comparisons emit the guard for the branch actually taken,
//! `EVAL`/`CASE`/`UPDATE` guard on info tables, calls and returns guard on
//! return addresses. Virtual frames are tracked in the abstract slot array
//! and in the call-stack shadow; the branch-target buffer decides when the
//! trace closes.
//!
//! All guards of one bytecode precede any slot write, so a failing guard
//! deoptimises into exactly the state the interpreter had before the
//! instruction.

use super::{
    ir::{
        IrBuffer, IrType, Opcode, TRef, TyBits, SAVE_FALLTHROUGH, SAVE_LINK, SAVE_LOOP,
    },
    opt, Jit, RecordStatus, TraceError, TraceType,
};
use crate::vm::{
    bytecode::{bc_round, BcIns, BcOp, Code, LitType},
    closure::{
        misc_closures, ClosureRef, InfoKind, PapRef, PAP_FUNCTION_WORD, PAP_INFO_WORD,
        PAP_PAYLOAD_WORD, PAP_HEADER_WORDS, UPDATE_FRAME_SIZE,
    },
    thread::Thread,
    Word, WORD_SIZE,
};

/// Outcome of shadowing a single instruction.
enum Step {
    Continue,
    /// A `SAVE` was emitted; compile and stop.
    Finish,
}

fn littype_to_irtype(lt: LitType) -> IrType {
    match lt {
        LitType::Int => IrType::I64,
        LitType::Char => IrType::Chr,
        LitType::Str => IrType::Ptr,
        LitType::Word => IrType::U64,
        LitType::Closure => IrType::Clos,
        LitType::Info => IrType::Info,
        LitType::Pc => IrType::Pc,
    }
}

fn cond_op(op: BcOp) -> Opcode {
    match op {
        BcOp::Islt => Opcode::Lt,
        BcOp::Isge => Opcode::Ge,
        BcOp::Isle => Opcode::Le,
        BcOp::Isgt => Opcode::Gt,
        BcOp::Iseq => Opcode::Eq,
        BcOp::Isne => Opcode::Ne,
        BcOp::Isltu => Opcode::Ult,
        BcOp::Isgeu => Opcode::Uge,
        BcOp::Isleu => Opcode::Ule,
        BcOp::Isgtu => Opcode::Ugt,
        _ => unreachable!("not a comparison: {:?}", op),
    }
}

/// Evaluate the comparison the interpreter is about to take.
fn eval_cond(op: BcOp, left: Word, right: Word) -> bool {
    let (sl, sr) = (left as i64, right as i64);
    let (ul, ur) = (left as u64, right as u64);
    match op {
        BcOp::Islt => sl < sr,
        BcOp::Isge => sl >= sr,
        BcOp::Isle => sl <= sr,
        BcOp::Isgt => sl > sr,
        BcOp::Iseq => sl == sr,
        BcOp::Isne => sl != sr,
        BcOp::Isltu => ul < ur,
        BcOp::Isgeu => ul >= ur,
        BcOp::Isleu => ul <= ur,
        BcOp::Isgtu => ul > ur,
        _ => unreachable!(),
    }
}

/// `FREF` + `FLOAD` of a field at a word offset (counting the header).
fn load_field(
    buf: &mut IrBuffer,
    noderef: TRef,
    offset: u16,
    ty: IrType,
) -> Result<TRef, TraceError> {
    let fref = buf.emit(Opcode::Fref, TyBits::plain(IrType::Ptr), noderef.ref_(), offset)?;
    buf.emit(Opcode::Fload, TyBits::plain(ty), fref.ref_(), 0)
}

/// Guard that `noderef`'s info table is the one observed now.
fn specialise_on_info_table(
    buf: &mut IrBuffer,
    noderef: TRef,
    node: ClosureRef,
) -> Result<TRef, TraceError> {
    let info = unsafe { node.info() };
    let inforef = buf.literal(IrType::Info, info as *const _ as Word);
    buf.emit(
        Opcode::EqInfo,
        TyBits::guarded(IrType::Void),
        noderef.ref_(),
        inforef.ref_(),
    )?;
    Ok(noderef)
}

/// All PAPs share one info table, so guard on the packed size/mask word as
/// well.
fn specialise_on_pap_shape(
    buf: &mut IrBuffer,
    papref: TRef,
    pap: PapRef,
) -> Result<(), TraceError> {
    let packed = load_field(buf, papref, PAP_INFO_WORD as u16, IrType::I64)?;
    let expected = buf.literal(IrType::I64, unsafe { pap.packed_info() });
    buf.emit(
        Opcode::Eq,
        TyBits::guarded(IrType::Void),
        packed.ref_(),
        expected.ref_(),
    )?;
    Ok(())
}

/// Follow one indirection: guard on the indirection's info table, load its
/// target into the slot, and return the target closure.
fn follow_indirection(
    buf: &mut IrBuffer,
    slot: i32,
    tnode: ClosureRef,
) -> Result<ClosureRef, TraceError> {
    let noderef = {
        let s = buf.slot(slot);
        specialise_on_info_table(buf, s, tnode)?
    };
    let newnode = load_field(buf, noderef, 1, IrType::Clos)?;
    buf.set_slot(slot, newnode);
    Ok(ClosureRef::from_word(unsafe { tnode.payload(0) }))
}

fn clear_slots(buf: &mut IrBuffer, start: i32, end: i32) {
    for i in start..end {
        buf.set_slot(i, TRef::none());
    }
}

/// A PAP-stored or directly passed argument, counted in the callee's
/// argument order.
fn pap_or_direct_arg(
    buf: &mut IrBuffer,
    arg: u32,
    pap_args: u32,
    args: &[TRef],
    pap_ref: TRef,
) -> Result<TRef, TraceError> {
    if arg >= pap_args {
        Ok(args[(arg - pap_args) as usize])
    } else {
        load_field(
            buf,
            pap_ref,
            (PAP_PAYLOAD_WORD as u32 + arg) as u16,
            IrType::Unknown,
        )
    }
}

impl Jit {
    /// Shadow one interpreter step. Returns whether to continue recording,
    /// and compiles the trace when it closes.
    pub fn record_ins(&mut self, pc: *const BcIns, thread: &Thread, code: &Code) -> RecordStatus {
        debug_assert!(self.is_recording());
        match self.record_step(pc, thread, code) {
            Ok(Step::Continue) => RecordStatus::Continue,
            Ok(Step::Finish) => match self.finish_recording() {
                Ok(_) => RecordStatus::Finished,
                Err(e) => {
                    log::warn!("trace compilation failed: {}", e);
                    self.reset_recorder_state();
                    RecordStatus::Aborted
                }
            },
            Err(e) => {
                self.abort_recording(e);
                RecordStatus::Aborted
            }
        }
    }

    fn record_step(
        &mut self,
        pc: *const BcIns,
        thread: &Thread,
        code: &Code,
    ) -> Result<Step, TraceError> {
        if self.take_abort_request() {
            return Err(TraceError::InterpreterRequest);
        }
        let ins = unsafe { *pc };
        let base = thread.base_addr();
        self.buf.pc = pc as Word;

        if self.last_was_branch && pc != misc_closures().update_return_pc() {
            match self.btb.is_true_loop(pc as Word, &self.callstack) {
                Some(0) => return self.close_loop(),
                Some(_) if ins.opcode() != BcOp::Ifunc => {
                    // An inner loop: cut the trace here and let the loop
                    // grow its own trace at the fall-back point.
                    self.buf.emit_raw(
                        Opcode::Save,
                        TyBits::guarded(IrType::Void),
                        SAVE_FALLTHROUGH,
                        0,
                    );
                    return Ok(Step::Finish);
                }
                Some(_) => {}
                None => {
                    self.btb.emit(pc as Word, &self.callstack);
                    if self.btb.len() > self.params.max_trace {
                        return Err(TraceError::TraceTooLong);
                    }
                }
            }
        }
        self.last_was_branch = false;

        let rd = |slot: i64| -> Word { unsafe { *(base as *const Word).offset(slot as isize) } };

        match ins.opcode() {
            BcOp::Func | BcOp::Ifunc => {
                self.buf
                    .frame(base, base + ins.a() as usize * WORD_SIZE)?;
            }

            BcOp::Jfunc => {
                let Some(target) = self.lookup_fragment(pc) else {
                    return Err(TraceError::Nyi("JFUNC without fragment"));
                };
                self.buf.emit_raw(
                    Opcode::Save,
                    TyBits::guarded(IrType::Void),
                    SAVE_LINK,
                    target.as_u16(),
                );
                return Ok(Step::Finish);
            }

            BcOp::Loadk => {
                let lit_id = ins.d() as usize;
                let lit = code.lits[lit_id];
                let ty = littype_to_irtype(code.littypes[lit_id]);
                let litref = self.buf.literal(ty, lit);
                self.buf.set_slot(ins.a() as i32, litref);
            }

            op @ (BcOp::Islt
            | BcOp::Isge
            | BcOp::Isle
            | BcOp::Isgt
            | BcOp::Iseq
            | BcOp::Isne
            | BcOp::Isltu
            | BcOp::Isgeu
            | BcOp::Isleu
            | BcOp::Isgtu) => {
                let taken = eval_cond(op, rd(ins.a() as i64), rd(ins.d() as i64));
                let aref = self.buf.slot(ins.a() as i32);
                let dref = self.buf.slot(ins.d() as i32);
                let irop = if taken { cond_op(op) } else { cond_op(op).inverted() };
                self.buf.emit(
                    irop,
                    TyBits::guarded(IrType::Void),
                    aref.ref_(),
                    dref.ref_(),
                )?;
            }

            op @ (BcOp::Addrr
            | BcOp::Subrr
            | BcOp::Mulrr
            | BcOp::Divrr
            | BcOp::Remrr
            | BcOp::Band
            | BcOp::Bor
            | BcOp::Bxor
            | BcOp::Bshl
            | BcOp::Bshr) => {
                let irop = match op {
                    BcOp::Addrr => Opcode::Add,
                    BcOp::Subrr => Opcode::Sub,
                    BcOp::Mulrr => Opcode::Mul,
                    BcOp::Divrr => Opcode::Div,
                    BcOp::Remrr => Opcode::Rem,
                    BcOp::Band => Opcode::Band,
                    BcOp::Bor => Opcode::Bor,
                    BcOp::Bxor => Opcode::Bxor,
                    BcOp::Bshl => Opcode::Bshl,
                    _ => Opcode::Bshr,
                };
                let bref = self.buf.slot(ins.b() as i32);
                let cref = self.buf.slot(ins.c() as i32);
                let aref =
                    self.buf
                        .emit(irop, TyBits::plain(IrType::I64), bref.ref_(), cref.ref_())?;
                self.buf.set_slot(ins.a() as i32, aref);
            }

            op @ (BcOp::Neg | BcOp::Bnot) => {
                let irop = if op == BcOp::Neg { Opcode::Neg } else { Opcode::Bnot };
                let dref = self.buf.slot(ins.d() as i32);
                let aref = self
                    .buf
                    .emit(irop, TyBits::plain(IrType::I64), dref.ref_(), 0)?;
                self.buf.set_slot(ins.a() as i32, aref);
            }

            BcOp::Ptrofsc => {
                let ptrref = self.buf.slot(ins.b() as i32);
                let ofsref = self.buf.slot(ins.c() as i32);
                let aref = self.buf.emit(
                    Opcode::Pload,
                    TyBits::plain(IrType::I64),
                    ptrref.ref_(),
                    ofsref.ref_(),
                )?;
                self.buf.set_slot(ins.a() as i32, aref);
            }

            BcOp::Mov => {
                let d = self.buf.slot(ins.d() as i32);
                self.buf.set_slot(ins.a() as i32, d);
            }

            BcOp::Loadslf => {
                let node = self.buf.slot(-1);
                self.buf.set_slot(ins.a() as i32, node);
            }

            BcOp::MovRes => {
                let topslot = self.buf.slots.top_slot();
                let resultslot = topslot + crate::vm::thread::FRAME_SIZE as i32 + ins.d() as i32;
                let result = self.buf.slot(resultslot);
                // Clear the result slot so it does not linger in snapshots;
                // the bytecode compiler never reads the same result twice.
                self.buf.set_slot(resultslot, TRef::none());
                self.buf.set_slot(ins.a() as i32, result);
            }

            BcOp::Eval => {
                let mut tnode = ClosureRef::from_word(rd(ins.a() as i64));
                while unsafe { tnode.is_indirection() } {
                    tnode = follow_indirection(&mut self.buf, ins.a() as i32, tnode)?;
                }
                let noderef = self.buf.slot(ins.a() as i32);
                specialise_on_info_table(&mut self.buf, noderef, tnode)?;
                let topslot =
                    ((thread.top_addr() - base) / WORD_SIZE) as i32;
                if unsafe { tnode.is_hnf() } {
                    self.buf.set_slot(
                        topslot + crate::vm::thread::FRAME_SIZE as i32,
                        noderef,
                    );
                } else {
                    debug_assert_eq!(self.buf.slots.top_slot(), topslot);
                    let info = unsafe { tnode.info() };
                    let framesize = info.code().framesize as u32;
                    let return_pc = unsafe { pc.add(2) };
                    let misc = misc_closures();
                    let upd_clos = self.buf.literal(IrType::Clos, misc.update_closure());
                    let newbase =
                        self.push_frame(base, return_pc, upd_clos, UPDATE_FRAME_SIZE)?;
                    self.buf.set_slot(0, noderef);
                    self.buf.set_slot(1, TRef::none());
                    self.push_frame(newbase, misc.update_return_pc(), noderef, framesize)?;
                    clear_slots(&mut self.buf, 0, framesize as i32);
                    self.last_was_branch = true;
                }
            }

            BcOp::Ret1 | BcOp::Iret => {
                let retref = self.buf.slot(-2);
                let expected = self.buf.literal(IrType::Pc, rd(-2));
                self.buf.emit(
                    Opcode::Eq,
                    TyBits::guarded(IrType::Void),
                    retref.ref_(),
                    expected.ref_(),
                )?;
                self.callstack.return_to(expected.ref_() as Word);

                let resultref = self.buf.slot(ins.a() as i32);
                let top = self.buf.slots.top_slot();
                clear_slots(&mut self.buf, -3, top);
                self.buf.set_slot(0, resultref);

                // The return address implies the caller's frame size; no
                // extra guard needed.
                let newbase = rd(-3);
                self.buf.frame(newbase, base - 3 * WORD_SIZE)?;
                self.last_was_branch = true;
            }

            BcOp::Retn => {
                let retref = self.buf.slot(-2);
                let expected = self.buf.literal(IrType::Pc, rd(-2));
                self.buf.emit(
                    Opcode::Eq,
                    TyBits::guarded(IrType::Void),
                    retref.ref_(),
                    expected.ref_(),
                )?;
                self.callstack.return_to(expected.ref_() as Word);
                clear_slots(&mut self.buf, -3, 0);
                let top = self.buf.slots.top_slot();
                clear_slots(&mut self.buf, ins.a() as i32, top);
                let newbase = rd(-3);
                self.buf.frame(newbase, base - 3 * WORD_SIZE)?;
                self.last_was_branch = true;
            }

            BcOp::Update => {
                let oldnode = ClosureRef::from_word(rd(ins.a() as i64));
                let info = unsafe { oldnode.info() };
                if info.kind == InfoKind::Caf {
                    return Err(TraceError::Nyi("update of a CAF"));
                }
                let oldref = self.buf.slot(ins.a() as i32);
                let newref = self.buf.slot(ins.d() as i32);
                // Overspecialise on the updatee's info table; the update
                // usually follows an eval of the same closure, making this
                // guard free.
                let inforef = self.buf.literal(IrType::Info, info as *const _ as Word);
                self.buf.emit(
                    Opcode::EqInfo,
                    TyBits::guarded(IrType::Void),
                    oldref.ref_(),
                    inforef.ref_(),
                )?;
                self.buf.emit(
                    Opcode::Update,
                    TyBits::plain(IrType::Void),
                    oldref.ref_(),
                    newref.ref_(),
                )?;
            }

            BcOp::Loadf => {
                let rbase = self.buf.slot(ins.b() as i32);
                let res = load_field(&mut self.buf, rbase, ins.c() as u16, IrType::Unknown)?;
                self.buf.set_slot(ins.a() as i32, res);
            }

            BcOp::Loadfv => {
                let rbase = self.buf.slot(-1);
                let res = load_field(&mut self.buf, rbase, ins.d(), IrType::Unknown)?;
                self.buf.set_slot(ins.a() as i32, res);
            }

            BcOp::Alloc1 => {
                let itbl = self.buf.slot(ins.b() as i32);
                let field = self.buf.slot(ins.c() as i32);
                self.buf.emit_heap_check(2)?;
                let (clos, entry) = self.buf.emit_new(itbl, 1);
                self.buf.set_field(entry, 0, field);
                self.buf.set_slot(ins.a() as i32, clos);
            }

            BcOp::Alloc => {
                let itbl = self.buf.slot(ins.b() as i32);
                let nfields = ins.c() as usize;
                self.buf.emit_heap_check(1 + nfields as u16)?;
                let argp = unsafe { pc.add(1) } as *const u8;
                // Materialise every field reference before the NEW so any
                // lazy slot loads precede it.
                let mut fields = Vec::with_capacity(nfields);
                for i in 0..nfields {
                    let slot = unsafe { *argp.add(i) };
                    fields.push(self.buf.slot(slot as i32));
                }
                let (clos, entry) = self.buf.emit_new(itbl, nfields as u16);
                for (i, f) in fields.iter().enumerate() {
                    self.buf.set_field(entry, i as u16, *f);
                }
                self.buf.set_slot(ins.a() as i32, clos);
            }

            BcOp::Allocap => {
                let nfields = ins.c() as usize + 1;
                let pointer_mask = ins.b() as u32;
                self.buf.emit_heap_check(1 + nfields as u16)?;
                let argp = unsafe { pc.add(1) } as *const u8;
                let mut fields = Vec::with_capacity(nfields);
                for i in 0..nfields {
                    let slot = unsafe { *argp.add(i) };
                    fields.push(self.buf.slot(slot as i32));
                }
                let info = misc_closures().ap_info(ins.c() as u32, pointer_mask);
                let itbl = self.buf.literal(IrType::Info, info.as_word());
                let (clos, entry) = self.buf.emit_new(itbl, nfields as u16);
                for (i, f) in fields.iter().enumerate() {
                    self.buf.set_field(entry, i as u16, *f);
                }
                self.buf.set_slot(ins.a() as i32, clos);
            }

            BcOp::Case | BcOp::CaseS => {
                let cl = ClosureRef::from_word(rd(ins.a() as i64));
                let clos = self.buf.slot(ins.a() as i32);
                let itbl = self
                    .buf
                    .literal(IrType::Info, unsafe { cl.info() } as *const _ as Word);
                self.buf.emit(
                    Opcode::EqInfo,
                    TyBits::guarded(IrType::Void),
                    clos.ref_(),
                    itbl.ref_(),
                )?;
            }

            BcOp::Gettag => {
                // Overspecialise: GETTAG is almost always followed by a tag
                // comparison, so pin the info table and load a constant.
                let cl = ClosureRef::from_word(rd(ins.d() as i64));
                debug_assert!(unsafe { !cl.is_indirection() && cl.is_hnf() });
                let clos = self.buf.slot(ins.d() as i32);
                specialise_on_info_table(&mut self.buf, clos, cl)?;
                let tag = unsafe { cl.info() }.tag as Word;
                let taglit = self.buf.literal(IrType::I64, tag.wrapping_sub(1));
                self.buf.set_slot(ins.a() as i32, taglit);
            }

            BcOp::Jmp => {}

            BcOp::Callt => {
                let mut clos = ClosureRef::from_word(rd(ins.a() as i64));
                while unsafe { clos.is_indirection() } {
                    clos = follow_indirection(&mut self.buf, ins.a() as i32, clos)?;
                }
                let direct_args = ins.c() as u32;
                let mut args = Vec::with_capacity(direct_args as usize);
                for i in 0..direct_args {
                    args.push(self.buf.slot(i as i32));
                }
                let node_ref = self.buf.slot(ins.a() as i32);
                let pointer_mask = unsafe { (*pc.add(1)).word() };
                self.record_generic_apply(
                    direct_args,
                    pointer_mask,
                    base,
                    node_ref,
                    clos,
                    &args,
                    None,
                )?;
                self.last_was_branch = true;
            }

            BcOp::Call => {
                let mut clos = ClosureRef::from_word(rd(ins.a() as i64));
                while unsafe { clos.is_indirection() } {
                    clos = follow_indirection(&mut self.buf, ins.a() as i32, clos)?;
                }
                let nargs = ins.c() as u32;
                let fnode_ref = self.buf.slot(ins.a() as i32);
                let pointer_mask = unsafe { (*pc.add(1)).word() };
                let argp = unsafe { pc.add(2) } as *const u8;
                let mut args = Vec::with_capacity(nargs as usize);
                for i in 0..nargs as usize {
                    let slot = unsafe { *argp.add(i) };
                    args.push(self.buf.slot(slot as i32));
                }
                let return_pc = unsafe { pc.add(2 + bc_round(nargs as usize)) };
                self.record_generic_apply(
                    nargs,
                    pointer_mask,
                    base,
                    fnode_ref,
                    clos,
                    &args,
                    Some(return_pc),
                )?;
                self.last_was_branch = true;
            }

            BcOp::Jret | BcOp::Stop => {
                return Err(TraceError::Nyi("recording of this opcode"));
            }
        }

        Ok(Step::Continue)
    }

    /// The trace branched back to its own head: optionally unroll, then
    /// close with `SAVE(LOOP)`.
    fn close_loop(&mut self) -> Result<Step, TraceError> {
        if self.opts.opt_unroll
            && self.trace_type == TraceType::Root
            && self.buf.slots.relbase() == 0
        {
            opt::unroll_loop(&mut self.buf)?;
        }
        self.buf
            .emit_raw(Opcode::Save, TyBits::guarded(IrType::Void), SAVE_LOOP, 0);
        Ok(Step::Finish)
    }

    /// Push a virtual frame: header `[saved base, return pc, node]`, then a
    /// fresh frame of `framesize` slots. Returns the new virtual base
    /// address.
    fn push_frame(
        &mut self,
        base: Word,
        return_pc: *const BcIns,
        noderef: TRef,
        framesize: u32,
    ) -> Result<Word, TraceError> {
        let topslot = self.buf.slots.top_slot();
        let ret_ref = self.buf.literal(IrType::Pc, return_pc as Word);
        self.callstack.push_frame(ret_ref.ref_() as Word);
        let saved_base = self.buf.base_literal(base);
        self.buf.set_slot(topslot, saved_base);
        self.buf.set_slot(topslot + 1, ret_ref);
        self.buf.set_slot(topslot + 2, noderef);
        let newbase = base + (topslot as usize + 3) * WORD_SIZE;
        self.buf
            .frame(newbase, newbase + framesize as usize * WORD_SIZE)?;
        Ok(newbase)
    }

    /// Record a call of `fnode` with `direct_args` arguments, whatever the
    /// callee turns out to be.
    ///
    /// The call convention is picked from the observed closure: a `PAP` is
    /// unwrapped (guarding on its info table and shape), a thunk becomes an
    /// application continuation plus an update frame plus an eval frame,
    /// and a function dispatches on its arity into an exact call, an
    /// overapplication, or the construction of a new PAP.
    ///
    /// Every guard is emitted before the first slot write, so a guard
    /// failure restores the caller's exact state.
    #[allow(clippy::too_many_arguments)]
    fn record_generic_apply(
        &mut self,
        direct_args: u32,
        pointer_mask: u32,
        base: Word,
        fnode_ref: TRef,
        fnode: ClosureRef,
        args: &[TRef],
        return_pc: Option<*const BcIns>,
    ) -> Result<(), TraceError> {
        let misc = misc_closures();
        let mut target = fnode;
        let mut pap: Option<PapRef> = None;
        let mut pap_args = 0u32;

        let mut kind = unsafe { target.info() }.kind;

        // A PAP's function can never itself be a PAP, so one unwrap level
        // suffices.
        if kind == InfoKind::Pap {
            let p = PapRef(target);
            pap_args = unsafe { p.nargs() };
            specialise_on_info_table(&mut self.buf, fnode_ref, target)?;
            specialise_on_pap_shape(&mut self.buf, fnode_ref, p)?;
            target = unsafe { p.fun() };
            kind = unsafe { target.info() }.kind;
            debug_assert_eq!(kind, InfoKind::Fun);
            pap = Some(p);
        } else if kind == InfoKind::Thunk || kind == InfoKind::Caf {
            specialise_on_info_table(&mut self.buf, fnode_ref, target)?;

            // Turn the call into: evaluate the thunk under an update frame,
            // then apply the saved arguments through an AP continuation.
            let apk = misc.ap_cont(direct_args, pointer_mask);
            let apk_framesize = crate::vm::closure::ap_cont_framesize(direct_args);
            let apk_clos = self.buf.literal(IrType::Clos, apk.closure);

            let base = match return_pc {
                Some(rpc) => self.push_frame(base, rpc, apk_clos, apk_framesize)?,
                None => {
                    self.buf
                        .frame(base, base + apk_framesize as usize * WORD_SIZE)?;
                    self.buf.set_slot(-1, apk_clos);
                    base
                }
            };
            for (i, a) in args.iter().enumerate() {
                self.buf.set_slot(i as i32, *a);
            }
            clear_slots(&mut self.buf, direct_args as i32, apk_framesize as i32);

            let upd_clos = self.buf.literal(IrType::Clos, misc.update_closure());
            let newbase =
                self.push_frame(base, apk.return_pc, upd_clos, UPDATE_FRAME_SIZE)?;
            self.buf.set_slot(0, fnode_ref);
            self.buf.set_slot(1, TRef::none());

            let framesize = unsafe { target.info() }.code().framesize as u32;
            self.push_frame(newbase, misc.update_return_pc(), fnode_ref, framesize)?;
            return Ok(());
        }

        debug_assert_eq!(kind, InfoKind::Fun);
        let info = unsafe { target.info() };
        let arity = info.code().arity as u32;
        let total_args = direct_args + pap_args;

        // The function value the new frame's node slot gets: for a PAP
        // call, the function is loaded out of the PAP payload.
        let funref = match pap {
            None => fnode_ref,
            Some(_) => load_field(
                &mut self.buf,
                fnode_ref,
                PAP_FUNCTION_WORD as u16,
                IrType::Clos,
            )?,
        };
        specialise_on_info_table(&mut self.buf, funref, target)?;

        if arity == total_args {
            // Exact application.
            let framesize = info.code().framesize as u32;
            match return_pc {
                Some(rpc) => {
                    self.push_frame(base, rpc, funref, framesize)?;
                }
                None => {
                    self.buf.set_slot(-1, funref);
                    self.buf
                        .frame(base, base + framesize as usize * WORD_SIZE)?;
                }
            }
            for i in 0..pap_args {
                let a = load_field(
                    &mut self.buf,
                    fnode_ref,
                    (PAP_PAYLOAD_WORD as u32 + i) as u16,
                    IrType::Unknown,
                )?;
                self.buf.set_slot(i as i32, a);
            }
            for (i, a) in args.iter().enumerate() {
                self.buf.set_slot(pap_args as i32 + i as i32, *a);
            }
            clear_slots(&mut self.buf, total_args as i32, framesize as i32);
            Ok(())
        } else if arity < total_args {
            // Overapplication: stash the excess arguments in an AP
            // continuation, then call the function exactly.
            let extra_args = total_args - arity;
            let apk = misc.ap_cont(extra_args, pointer_mask >> arity);
            let apk_framesize = crate::vm::closure::ap_cont_framesize(extra_args);
            let apk_clos = self.buf.literal(IrType::Clos, apk.closure);

            let base = match return_pc {
                Some(rpc) => self.push_frame(base, rpc, apk_clos, apk_framesize)?,
                None => {
                    self.buf
                        .frame(base, base + apk_framesize as usize * WORD_SIZE)?;
                    self.buf.set_slot(-1, apk_clos);
                    base
                }
            };
            for i in 0..extra_args {
                let a = pap_or_direct_arg(&mut self.buf, arity + i, pap_args, args, fnode_ref)?;
                self.buf.set_slot(i as i32, a);
            }
            clear_slots(&mut self.buf, extra_args as i32, apk_framesize as i32);

            let framesize = info.code().framesize as u32;
            self.push_frame(base, apk.return_pc, funref, framesize)?;
            for i in 0..arity {
                let a = pap_or_direct_arg(&mut self.buf, i, pap_args, args, fnode_ref)?;
                self.buf.set_slot(i as i32, a);
            }
            clear_slots(&mut self.buf, arity as i32, framesize as i32);
            Ok(())
        } else {
            // Partial application: build a new PAP on the heap.
            let expected_ret = match return_pc {
                // Returning straight to `return_pc`: no guard needed.
                Some(_) => None,
                None => {
                    let retref = self.buf.slot(-2);
                    let expected = self
                        .buf
                        .literal(IrType::Pc, unsafe { *(base as *const Word).offset(-2) });
                    self.buf.emit(
                        Opcode::Eq,
                        TyBits::guarded(IrType::Void),
                        retref.ref_(),
                        expected.ref_(),
                    )?;
                    Some(expected)
                }
            };

            let nfields = (PAP_HEADER_WORDS - 1 + total_args as usize) as u16;
            self.buf.emit_heap_check(1 + nfields)?;

            // Argument references must exist before the NEW so their lazy
            // loads precede it.
            let mut arg_refs = Vec::with_capacity(total_args as usize);
            for i in 0..total_args {
                arg_refs.push(pap_or_direct_arg(
                    &mut self.buf,
                    i,
                    pap_args,
                    args,
                    fnode_ref,
                )?);
            }

            let mut mask = pointer_mask;
            if let Some(p) = pap {
                mask <<= pap_args;
                mask |= crate::vm::closure::pap_pointer_mask(unsafe { p.packed_info() });
            }
            let packed = self
                .buf
                .literal(IrType::I64, crate::vm::closure::pap_pack(total_args, mask));

            let pap_itbl = self
                .buf
                .literal(IrType::Info, misc.pap_info().as_word());
            let (new_pap, entry) = self.buf.emit_new(pap_itbl, nfields);
            self.buf.set_field(entry, (PAP_INFO_WORD - 1) as u16, packed);
            self.buf
                .set_field(entry, (PAP_FUNCTION_WORD - 1) as u16, funref);
            for (i, a) in arg_refs.iter().enumerate() {
                self.buf
                    .set_field(entry, (PAP_PAYLOAD_WORD - 1 + i) as u16, *a);
            }

            match return_pc {
                Some(_) => {
                    // Leave the PAP as the call's result for MOV_RES.
                    let top = self.buf.slots.top_slot();
                    self.buf
                        .set_slot(top + crate::vm::thread::FRAME_SIZE as i32, new_pap);
                }
                None => {
                    // Tail position: return the PAP to the caller.
                    let top = self.buf.slots.top_slot();
                    clear_slots(&mut self.buf, -3, top);
                    self.buf.set_slot(0, new_pap);
                    let expected = expected_ret.unwrap();
                    self.callstack.return_to(expected.ref_() as Word);
                    let newbase = unsafe { *(base as *const Word).offset(-3) };
                    self.buf.frame(newbase, base - 3 * WORD_SIZE)?;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jit::{ir::REF_FIRST, JitOpts, JitParams},
        vm::closure::{alloc_static_closure, alloc_static_pap, InfoTable},
    };
    use std::sync::OnceLock;

    fn test_jit() -> Jit {
        let mut opts = JitOpts::default();
        opts.enable_asm = false;
        opts.opt_unroll = false;
        Jit::new(JitParams::default(), opts)
    }

    fn start(jit: &mut Jit, thread: &mut Thread, pc: *const BcIns) {
        let base = thread.base_ptr();
        let top = thread.top_ptr();
        jit.begin_recording(pc, base, top, false);
    }

    fn guard_count(jit: &Jit) -> usize {
        let buf = &jit.buf;
        (REF_FIRST..buf.bufmax())
            .filter(|&r| buf.ir(r).is_guard() && buf.ir(r).opcode() != Opcode::Save)
            .count()
    }

    #[test]
    fn records_arithmetic_into_slots() {
        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(1, 7);
        thread.set_slot(2, 35);
        let code = Code::new(0, 8);
        let prog = [BcIns::abc(BcOp::Addrr, 0, 1, 2)];
        start(&mut jit, &mut thread, prog.as_ptr());
        let st = jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        let buf = jit.buffer();
        let t = buf.slots.get(0);
        assert!(!t.is_none());
        assert_eq!(buf.ir(t.ref_()).opcode(), Opcode::Add);
        // Operands are lazy loads of slots 1 and 2.
        let a = buf.ir(t.ref_()).op1();
        assert_eq!(buf.ir(a).opcode(), Opcode::Sload);
        assert_eq!(IrBuffer::sload_slot(buf.ir(a)), 1);
    }

    #[test]
    fn comparison_specialises_on_the_taken_branch() {
        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, 5);
        thread.set_slot(1, 9);
        let code = Code::new(0, 8);
        // 5 < 9 holds: the guard keeps the LT form.
        let prog = [BcIns::ad(BcOp::Islt, 0, 1)];
        start(&mut jit, &mut thread, prog.as_ptr());
        jit.record_ins(prog.as_ptr(), &thread, &code);
        assert!(jit.buf.chain_head(Opcode::Lt) != 0);

        // 9 < 5 fails: the guard is inverted to GE.
        let mut jit = test_jit();
        thread.set_slot(0, 9);
        thread.set_slot(1, 5);
        start(&mut jit, &mut thread, prog.as_ptr());
        jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(jit.buf.chain_head(Opcode::Lt), 0);
        assert!(jit.buf.chain_head(Opcode::Ge) != 0);
    }

    #[test]
    fn loadk_emits_a_typed_literal() {
        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        let mut code = Code::new(0, 8);
        let id = code.push_lit(LitType::Int, 4242);
        let prog = [BcIns::ad(BcOp::Loadk, 3, id)];
        start(&mut jit, &mut thread, prog.as_ptr());
        jit.record_ins(prog.as_ptr(), &thread, &code);
        let t = jit.buf.slots.get(3);
        assert!(t.is_literal());
        assert_eq!(t.ty(), IrType::I64);
        assert_eq!(jit.buf.literal_value(t.ref_(), 0), 4242);
    }

    #[test]
    fn case_guards_on_the_scrutinee_info_table() {
        static CONS: OnceLock<InfoTable> = OnceLock::new();
        let info = CONS.get_or_init(|| InfoTable::data(InfoKind::Constr, 1, 2, "Cons"));
        let cl = alloc_static_closure(info, &[1, 2]);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, cl.as_word());
        let code = Code::new(0, 8);
        let prog = [BcIns::ad(BcOp::Case, 0, 0)];
        start(&mut jit, &mut thread, prog.as_ptr());
        jit.record_ins(prog.as_ptr(), &thread, &code);
        let g = jit.buf.chain_head(Opcode::EqInfo);
        assert!(g != 0);
        let itbl = jit.buf.ir(g).op2();
        assert_eq!(jit.buf.literal_value(itbl, 0), info.as_word());
        // The guard carries a snapshot.
        assert_eq!(jit.buf.snaps().len(), 1);
    }

    #[test]
    fn alloc1_emits_heap_check_new_and_fields() {
        static CONS: OnceLock<InfoTable> = OnceLock::new();
        let info = CONS.get_or_init(|| InfoTable::data(InfoKind::Constr, 1, 1, "Just"));

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(1, info.as_word());
        thread.set_slot(2, 123);
        let code = Code::new(0, 8);
        let prog = [BcIns::abc(BcOp::Alloc1, 0, 1, 2)];
        start(&mut jit, &mut thread, prog.as_ptr());
        jit.record_ins(prog.as_ptr(), &thread, &code);
        let chk = jit.buf.chain_head(Opcode::HeapChk);
        assert_eq!(jit.buf.ir(chk).op1(), 2);
        let newr = jit.buf.chain_head(Opcode::New);
        assert!(newr != 0);
        let entry = jit.buf.ir(newr).op2();
        assert_eq!(jit.buf.heap.entry(entry).nfields(), 1);
        let t = jit.buf.slots.get(0);
        assert_eq!(t.ref_(), newr);
    }

    fn fun_info(arity: u8, framesize: u8) -> &'static InfoTable {
        Box::leak(Box::new(InfoTable::entry(
            InfoKind::Fun,
            Code::new(arity, framesize),
            "f",
        )))
    }

    #[test]
    fn call_exact_pushes_one_frame() {
        let info = fun_info(2, 4);
        let f = alloc_static_closure(info, &[]);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, f.as_word());
        thread.set_slot(1, 10);
        thread.set_slot(2, 20);
        let code = Code::new(0, 8);
        // CALL f with args from slots 1 and 2.
        let prog = [
            BcIns::abc(BcOp::Call, 0, 0, 2),
            BcIns::raw(0), // pointer mask
            BcIns::raw(0x0201), // arg slot bytes: 1, 2
        ];
        start(&mut jit, &mut thread, prog.as_ptr());
        let st = jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        assert_eq!(guard_count(&jit), 1); // info table only
        // The virtual frame moved: relbase = old top + frame header.
        assert_eq!(jit.buf.slots.relbase(), 8 + 3);
        // Arguments are in the callee's slots 0 and 1.
        let a0 = jit.buf.slots.get(0);
        let a1 = jit.buf.slots.get(1);
        assert_eq!(IrBuffer::sload_slot(jit.buf.ir(a0.ref_())), 1);
        assert_eq!(IrBuffer::sload_slot(jit.buf.ir(a1.ref_())), 2);
        // The node slot holds the callee.
        let node = jit.buf.slots.get(-1);
        assert!(!node.is_none());
    }

    #[test]
    fn overapplication_builds_ap_continuation_then_exact_call() {
        // Scenario: callee arity 2, four arguments in total.
        let info = fun_info(2, 4);
        let f = alloc_static_closure(info, &[]);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, f.as_word());
        for i in 0..4 {
            thread.set_slot(1 + i, 100 + i as Word);
        }
        let code = Code::new(0, 8);
        let prog = [
            BcIns::abc(BcOp::Call, 0, 0, 4),
            BcIns::raw(0),
            BcIns::raw(0x04030201),
        ];
        start(&mut jit, &mut thread, prog.as_ptr());
        let st = jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        // One guard on the function's info table.
        assert_eq!(guard_count(&jit), 1);
        // Two frames were pushed: the AP continuation and the exact call.
        assert_eq!(jit.callstack.depth(jit.callstack.current()), 3);
        // The callee frame holds the first two arguments...
        let a0 = jit.buf.slots.get(0);
        let a1 = jit.buf.slots.get(1);
        assert_eq!(IrBuffer::sload_slot(jit.buf.ir(a0.ref_())), 1);
        assert_eq!(IrBuffer::sload_slot(jit.buf.ir(a1.ref_())), 2);
        // ...and the AP continuation frame below holds the extra two: the
        // callee's base is its caller's base + apk frame + header.
        let apk_framesize = crate::vm::closure::ap_cont_framesize(2) as i32;
        let callee_base_rel = 8 + 3 + apk_framesize + 3;
        assert_eq!(jit.buf.slots.relbase(), callee_base_rel);
        let x0 = jit.buf.slots.get(0 - apk_framesize - 3);
        let x1 = jit.buf.slots.get(1 - apk_framesize - 3);
        assert_eq!(IrBuffer::sload_slot(jit.buf.ir(x0.ref_())), 3);
        assert_eq!(IrBuffer::sload_slot(jit.buf.ir(x1.ref_())), 4);
    }

    #[test]
    fn pap_call_guards_info_table_and_shape() {
        // A PAP holding one argument of a two-ary function, called with
        // one more argument: exact application after unwrapping.
        let info = fun_info(2, 4);
        let f = alloc_static_closure(info, &[]);
        let pap = alloc_static_pap(f, &[55], 0);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, pap.as_word());
        thread.set_slot(1, 10);
        let code = Code::new(0, 8);
        let prog = [
            BcIns::abc(BcOp::Call, 0, 0, 1),
            BcIns::raw(0),
            BcIns::raw(0x01),
        ];
        start(&mut jit, &mut thread, prog.as_ptr());
        let st = jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        // Guards: PAP info table, PAP shape, function info table.
        assert_eq!(guard_count(&jit), 3);
        // Slot 0 of the callee frame is the PAP-stored argument, loaded
        // from the PAP payload.
        let a0 = jit.buf.slots.get(0);
        assert_eq!(jit.buf.ir(a0.ref_()).opcode(), Opcode::Fload);
        // Slot 1 is the direct argument.
        let a1 = jit.buf.slots.get(1);
        assert_eq!(jit.buf.ir(a1.ref_()).opcode(), Opcode::Sload);
    }

    #[test]
    fn undersaturated_call_builds_a_pap() {
        let info = fun_info(3, 5);
        let f = alloc_static_closure(info, &[]);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, f.as_word());
        thread.set_slot(1, 10);
        let code = Code::new(0, 8);
        let prog = [
            BcIns::abc(BcOp::Call, 0, 0, 1),
            BcIns::raw(0),
            BcIns::raw(0x01),
        ];
        start(&mut jit, &mut thread, prog.as_ptr());
        let st = jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        // A heap check for the PAP and a NEW with header + one argument.
        let chk = jit.buf.chain_head(Opcode::HeapChk);
        assert_eq!(jit.buf.ir(chk).op1() as usize, PAP_HEADER_WORDS + 1);
        let newr = jit.buf.chain_head(Opcode::New);
        let entry = jit.buf.ir(newr).op2();
        assert_eq!(
            jit.buf.heap.entry(entry).nfields() as usize,
            PAP_HEADER_WORDS - 1 + 1
        );
        // The result is parked above the frame for MOV_RES.
        let top = jit.buf.slots.top_slot();
        let res = jit.buf.slots.get(top + crate::vm::thread::FRAME_SIZE as i32);
        assert_eq!(res.ref_(), newr);
    }

    #[test]
    fn thunk_call_pushes_ap_update_and_eval_frames() {
        let thunk_info: &'static InfoTable = Box::leak(Box::new(InfoTable::entry(
            InfoKind::Thunk,
            Code::new(0, 3),
            "t",
        )));
        let t = alloc_static_closure(thunk_info, &[0]);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, t.as_word());
        thread.set_slot(1, 10);
        let code = Code::new(0, 8);
        let prog = [
            BcIns::abc(BcOp::Call, 0, 0, 1),
            BcIns::raw(0),
            BcIns::raw(0x01),
        ];
        start(&mut jit, &mut thread, prog.as_ptr());
        let st = jit.record_ins(prog.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        // Three frames: AP continuation, update frame, thunk entry.
        assert_eq!(jit.callstack.depth(jit.callstack.current()), 4);
        assert_eq!(guard_count(&jit), 1);
    }

    #[test]
    fn ret1_guards_return_pc_and_pops_the_frame() {
        // The trace begins inside the callee, so the return address is only
        // known from the live stack and must be guarded.
        let f_info = fun_info(1, 3);
        let f = alloc_static_closure(f_info, &[]);
        let caller = [BcIns::ad(BcOp::Func, 8, 0), BcIns::ad(BcOp::MovRes, 0, 0)];
        let ret = [BcIns::ad(BcOp::Ret1, 0, 0)];

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        let return_pc = unsafe { caller.as_ptr().add(1) };
        thread.push_frame(return_pc, f.as_word(), 3);
        thread.set_slot(0, 42);
        let code = Code::new(0, 8);

        start(&mut jit, &mut thread, ret.as_ptr());
        let st = jit.record_ins(ret.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        // The frame popped below the entry frame.
        assert_eq!(jit.buf.slots.relbase(), -(3 + 8));
        // A return-PC guard was emitted: EQ against a PC literal.
        let eqs = jit.buf.chain_head(Opcode::Eq);
        assert!(eqs != 0);
        assert!(jit.buf.ir(eqs).is_guard());
        let lit = jit.buf.ir(eqs).op2();
        assert_eq!(jit.buf.literal_value(lit, 0), return_pc as Word);
    }

    #[test]
    fn intra_trace_return_folds_the_return_guard() {
        let info = fun_info(1, 3);
        let f = alloc_static_closure(info, &[]);

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 8);
        thread.set_slot(0, f.as_word());
        thread.set_slot(1, 77);
        let code = Code::new(0, 8);
        let call = [
            BcIns::abc(BcOp::Call, 0, 0, 1),
            BcIns::raw(0),
            BcIns::raw(0x01),
        ];
        let ret = [BcIns::ad(BcOp::Ret1, 0, 0)];
        start(&mut jit, &mut thread, call.as_ptr());
        jit.record_ins(call.as_ptr(), &thread, &code);
        // Mirror the recorder's virtual call on the concrete stack.
        let return_pc = unsafe { call.as_ptr().add(3) };
        thread.push_frame(return_pc, f.as_word(), 3);
        thread.set_slot(0, 42);

        let depth_before = jit.callstack.depth(jit.callstack.current());
        let st = jit.record_ins(ret.as_ptr(), &thread, &code);
        assert_eq!(st, RecordStatus::Continue);
        assert_eq!(
            jit.callstack.depth(jit.callstack.current()),
            depth_before - 1
        );
        assert_eq!(jit.buf.slots.relbase(), 0);
        // The return address was written by the trace itself: the guard
        // folded away.
        assert_eq!(jit.buf.chain_head(Opcode::Eq), 0);
    }

    #[test]
    fn tail_call_loop_closes_the_trace() {
        // f(x, y) = if y <= 0 then x else f(x + 5, y - 1)
        let finfo = fun_info(2, 6);
        let f = alloc_static_closure(finfo, &[]);

        // Mutable: the trace head is patched to JFUNC on completion.
        let mut prog = [
            BcIns::ad(BcOp::Func, 6, 0),
            BcIns::ad(BcOp::Isle, 1, 2),   // y <= 0 ?
            BcIns::abc(BcOp::Addrr, 0, 0, 4), // x += 5
            BcIns::abc(BcOp::Subrr, 1, 1, 3), // y -= 1
            BcIns::abc(BcOp::Callt, 5, 0, 2),
            BcIns::raw(0), // pointer mask
        ];
        let prog_ptr = prog.as_mut_ptr() as *const BcIns;

        let mut jit = test_jit();
        let mut thread = Thread::new(64, 6);
        thread.set_slot(0, 0); // x
        thread.set_slot(1, 5); // y
        thread.set_slot(2, 0); // const 0
        thread.set_slot(3, 1); // const 1
        thread.set_slot(4, 5); // const 5
        thread.set_slot(5, f.as_word());
        let code = finfo.code();

        start(&mut jit, &mut thread, prog_ptr);
        assert_eq!(jit.record_ins(prog_ptr, &thread, code), RecordStatus::Continue);
        assert_eq!(jit.record_ins(prog_ptr.wrapping_add(1), &thread, code), RecordStatus::Continue);
        assert_eq!(jit.record_ins(prog_ptr.wrapping_add(2), &thread, code), RecordStatus::Continue);
        // Mirror the interpreter's execution.
        thread.set_slot(0, 5);
        assert_eq!(jit.record_ins(prog_ptr.wrapping_add(3), &thread, code), RecordStatus::Continue);
        thread.set_slot(1, 4);
        assert_eq!(jit.record_ins(prog_ptr.wrapping_add(4), &thread, code), RecordStatus::Continue);
        // The tail call lands back on the function header: loop detected,
        // trace compiled and the header patched to dispatch into it.
        let st = jit.record_ins(prog_ptr, &thread, code);
        assert_eq!(st, RecordStatus::Finished);
        assert!(!jit.is_recording());
        assert_eq!(prog[0].opcode(), BcOp::Jfunc);
        let id = jit.lookup_fragment(prog_ptr).unwrap();
        let frag = jit.fragment(id);
        // The trace ends in SAVE(LOOP).
        let last = frag.last_ins();
        assert_eq!(last.opcode(), Opcode::Save);
        assert_eq!(last.op1(), SAVE_LOOP);
    }

    #[test]
    fn too_many_branch_targets_abort() {
        let info = fun_info(0, 4);
        let f = alloc_static_closure(info, &[]);
        let mut opts = JitOpts::default();
        opts.enable_asm = false;
        opts.opt_unroll = false;
        let mut params = JitParams::default();
        params.max_trace = 3;
        let mut jit = Jit::new(params, opts);

        let mut thread = Thread::new(64, 4);
        thread.set_slot(0, f.as_word());
        let code = Code::new(0, 4);
        // Distinct call sites so no loop forms.
        let mk = |_: usize| {
            [
                BcIns::abc(BcOp::Callt, 0, 0, 0),
                BcIns::raw(0),
            ]
        };
        let sites: Vec<[BcIns; 2]> = (0..8).map(mk).collect();
        start(&mut jit, &mut thread, sites[0].as_ptr());
        let mut aborted = false;
        for site in &sites {
            match jit.record_ins(site.as_ptr(), &thread, &code) {
                RecordStatus::Continue => {}
                RecordStatus::Aborted => {
                    aborted = true;
                    break;
                }
                RecordStatus::Finished => panic!("unexpected finish"),
            }
        }
        assert!(aborted);
        assert_eq!(jit.aborts.count(TraceError::TraceTooLong), 1);
    }
}
