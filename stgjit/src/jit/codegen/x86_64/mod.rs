//! The x86-64 code generator.
//!
//! Conventions used in this module:
//!   * Functions with a `cg_` prefix generate code for one IR construct.
//!   * `rbp` is the BASE register (trace entry frame), `r12` the heap
//!     pointer, `r14`/`r15` work registers for intermediate values.
//!
//! Compiled code is a function `(exit_state, base, hp, hplim) -> exit_no`.
//! The prologue saves the callee-saved registers, parks the exit-state and
//! heap-limit pointers in the frame, and loads the dedicated registers.
//! Every guard jumps to a per-exit stub that loads its exit number and
//! falls into a common tail which dumps all registers and spill slots into
//! the [ExitState] before returning. The only other way out of the code is
//! the loop backedge.

pub mod deopt;

use super::{
    parmove::{self, Loc, MoveOp},
    reg_alloc, Reg, RID_HP, WR0, WR1,
};
use crate::{
    jit::{
        ir::{
            irref_is_literal, snapshot::SnapEntry, Ir, IrBuffer, IrRef, Opcode, RID_NONE,
            REF_FIRST, SAVE_LOOP,
        },
        CompilationError,
    },
    vm::{closure::misc_closures, Word},
};
use dynasmrt::{
    dynasm, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer,
};
use std::collections::HashMap;

/// Machine state captured at a trace exit.
///
/// The layout is part of the target ABI: the common exit tail stores into
/// it with fixed offsets.
#[repr(C)]
pub struct ExitState {
    /// General-purpose registers, indexed by their encoding. `gpr[4]`
    /// (rsp) is not captured.
    pub gpr: [Word; 16],
    /// The heap limit the trace ran with.
    pub hplim: Word,
    /// The spill area (slot 1 lives at index 0).
    pub spill: [Word; 256],
}

const ES_HPLIM_OFF: i32 = 16 * 8;
const ES_SPILL_OFF: i32 = ES_HPLIM_OFF + 8;

static_assertions::const_assert_eq!(std::mem::offset_of!(ExitState, hplim), 128);
static_assertions::const_assert_eq!(std::mem::offset_of!(ExitState, spill), 136);

impl ExitState {
    pub fn new() -> Self {
        ExitState {
            gpr: [0; 16],
            hplim: 0,
            spill: [0; 256],
        }
    }
}

/// In-frame offsets (relative to rsp after the prologue).
const FRAME_ES: i32 = 0;
const FRAME_HPLIM: i32 = 8;
const FRAME_FIXED: i32 = 16;

fn spill_off(s: u8) -> i32 {
    FRAME_FIXED + (s as i32 - 1) * 8
}

type TraceFn =
    unsafe extern "sysv64" fn(*mut ExitState, *mut Word, *mut Word, *mut Word) -> u32;

/// A finished piece of machine code plus its entry point.
pub struct CompiledCode {
    buf: ExecutableBuffer,
    entry: AssemblyOffset,
    nspills: u32,
}

impl CompiledCode {
    /// Run the trace.
    ///
    /// # Safety
    ///
    /// `base` must point into a live stack with the layout the trace was
    /// recorded against, and `hp`/`hplim` must delimit writable heap.
    pub unsafe fn enter(
        &self,
        es: *mut ExitState,
        base: *mut Word,
        hp: *mut Word,
        hplim: *mut Word,
    ) -> u32 {
        let f: TraceFn = std::mem::transmute(self.buf.ptr(self.entry));
        f(es, base, hp, hplim)
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn nspills(&self) -> u32 {
        self.nspills
    }
}

/// Allocate registers and assemble the buffer into executable code.
pub fn codegen(buf: &mut IrBuffer) -> Result<CompiledCode, CompilationError> {
    let alloc = reg_alloc::allocate(buf)?;
    let cg = X64CodeGen::new(buf, alloc.nspills)?;
    cg.codegen()
}

struct X64CodeGen<'a> {
    buf: &'a IrBuffer,
    asm: dynasmrt::x64::Assembler,
    nspills: u32,
    frame_size: i32,
    /// One exit label per snapshot; the label index is the exit number.
    exit_labels: Vec<DynamicLabel>,
    /// Guard reference -> snapshot/exit number.
    snap_of: HashMap<IrRef, u32>,
    entry_label: DynamicLabel,
    loop_label: DynamicLabel,
}

impl<'a> X64CodeGen<'a> {
    fn new(buf: &'a IrBuffer, nspills: u32) -> Result<Self, CompilationError> {
        let mut asm = dynasmrt::x64::Assembler::new()
            .map_err(|e| CompilationError::ResourceExhausted(e.to_string()))?;
        let entry_label = asm.new_dynamic_label();
        let loop_label = asm.new_dynamic_label();
        let mut exit_labels = Vec::with_capacity(buf.snaps().len());
        let mut snap_of = HashMap::new();
        for (i, snap) in buf.snaps().iter().enumerate() {
            exit_labels.push(asm.new_dynamic_label());
            snap_of.insert(snap.ref_(), i as u32);
        }
        Ok(X64CodeGen {
            buf,
            asm,
            nspills,
            frame_size: (FRAME_FIXED + nspills as i32 * 8 + 15) & !15,
            exit_labels,
            snap_of,
            entry_label,
            loop_label,
        })
    }

    fn codegen(mut self) -> Result<CompiledCode, CompilationError> {
        self.emit_prologue();

        for r in REF_FIRST..self.buf.bufmax() {
            let ins = *self.buf.ir(r);
            self.cg_ins(r, &ins)?;
        }

        self.emit_exit_stubs();

        self.asm
            .commit()
            .map_err(|e| CompilationError::InternalError(format!("when committing: {e}")))?;
        let buf = self
            .asm
            .finalize()
            .map_err(|_| CompilationError::InternalError("assembler still in use".into()))?;
        Ok(CompiledCode {
            buf,
            entry: AssemblyOffset(0),
            nspills: self.nspills,
        })
    }

    fn emit_prologue(&mut self) {
        let frame = self.frame_size;
        dynasm!(self.asm
            ; push rbp
            ; push rbx
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, frame
            ; mov [rsp + FRAME_ES], rdi
            ; mov [rsp + FRAME_HPLIM], rcx
            ; mov rbp, rsi
            ; mov r12, rdx
        );
        let entry = self.entry_label;
        dynasm!(self.asm; =>entry);
    }

    /// The exit stubs and the common exit tail. Each stub loads its exit
    /// number and jumps to the tail, which dumps registers, the heap limit
    /// and the spill area into the [ExitState] and returns the number.
    fn emit_exit_stubs(&mut self) {
        for (i, l) in self.exit_labels.clone().into_iter().enumerate() {
            dynasm!(self.asm
                ; =>l
                ; mov Rd(WR0), i as i32
                ; jmp ->common_exit
            );
        }
        dynasm!(self.asm
            ; ->common_exit:
            ; mov Rq(WR1), [rsp + FRAME_ES]
        );
        for r in 0..16u8 {
            if r == 4 {
                continue; // rsp
            }
            let disp = r as i32 * 8;
            dynasm!(self.asm; mov [Rq(WR1) + disp], Rq(r));
        }
        dynasm!(self.asm
            ; mov rax, [rsp + FRAME_HPLIM]
            ; mov [Rq(WR1) + ES_HPLIM_OFF], rax
        );
        for s in 0..self.nspills as i32 {
            let src = FRAME_FIXED + s * 8;
            let dst = ES_SPILL_OFF + s * 8;
            dynasm!(self.asm
                ; mov rax, [rsp + src]
                ; mov [Rq(WR1) + dst], rax
            );
        }
        let frame = self.frame_size;
        dynasm!(self.asm
            ; mov eax, Rd(WR0)
            ; add rsp, frame
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbx
            ; pop rbp
            ; ret
        );
    }

    fn exit_label(&self, r: IrRef) -> DynamicLabel {
        let sn = self.snap_of[&r];
        self.exit_labels[sn as usize]
    }

    /// Load the value of `r` into `dst`.
    fn load_ref(&mut self, dst: Reg, r: IrRef) {
        if irref_is_literal(r) {
            let ins = self.buf.ir(r);
            if ins.opcode() == Opcode::Kbaseo {
                let disp = ins.i32v() * 8;
                dynasm!(self.asm; lea Rq(dst), [rbp + disp]);
            } else {
                let v = self.buf.literal_value(r, 0) as i64;
                dynasm!(self.asm; mov Rq(dst), QWORD v);
            }
            return;
        }
        let ins = self.buf.ir(r);
        if ins.reg() != RID_NONE {
            if ins.reg() != dst {
                let s = ins.reg();
                dynasm!(self.asm; mov Rq(dst), Rq(s));
            }
        } else if ins.spill() != 0 {
            let off = spill_off(ins.spill());
            dynasm!(self.asm; mov Rq(dst), [rsp + off]);
        } else {
            unreachable!("operand without a home: {}", r);
        }
    }

    /// The register the result of `r` is computed into.
    fn dest_reg(&self, r: IrRef) -> Reg {
        let reg = self.buf.ir(r).reg();
        if reg != RID_NONE {
            reg
        } else {
            WR0
        }
    }

    /// Move a result from `src` into the home of `r`.
    fn store_result(&mut self, r: IrRef, src: Reg) {
        let ins = self.buf.ir(r);
        if ins.reg() != RID_NONE {
            if ins.reg() != src {
                let d = ins.reg();
                dynasm!(self.asm; mov Rq(d), Rq(src));
            }
        } else if ins.spill() != 0 {
            let off = spill_off(ins.spill());
            dynasm!(self.asm; mov [rsp + off], Rq(src));
        }
        // No home: the value is dead; nothing to keep.
    }

    fn cg_ins(&mut self, r: IrRef, ins: &Ir) -> Result<(), CompilationError> {
        match ins.opcode() {
            Opcode::Nop | Opcode::Base | Opcode::Phi => {}
            Opcode::Kint | Opcode::Kword | Opcode::Kbaseo => {
                unreachable!("literal in the instruction region")
            }
            Opcode::Loop => {
                let l = self.loop_label;
                dynasm!(self.asm; =>l);
            }
            Opcode::Sload => self.cg_sload(r, ins),
            Opcode::Fref => self.cg_fref(r, ins),
            Opcode::Fload => self.cg_fload(r, ins),
            Opcode::Pload => self.cg_pload(r, ins),
            Opcode::Neg | Opcode::Bnot => self.cg_unop(r, ins),
            Opcode::Add
            | Opcode::Sub
            | Opcode::Band
            | Opcode::Bor
            | Opcode::Bxor
            | Opcode::Mul => self.cg_binop(r, ins),
            Opcode::Bshl | Opcode::Bshr => self.cg_shift(r, ins),
            Opcode::Div | Opcode::Rem => self.cg_divrem(r, ins),
            Opcode::Lt
            | Opcode::Ge
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ult
            | Opcode::Uge
            | Opcode::Ule
            | Opcode::Ugt
            | Opcode::Eq
            | Opcode::Ne => self.cg_cmp_guard(r, ins),
            Opcode::EqInfo => self.cg_eqinfo(r, ins),
            Opcode::HeapChk => self.cg_heapchk(r, ins),
            Opcode::New => self.cg_new(r, ins),
            Opcode::Update => self.cg_update(ins),
            Opcode::Save => self.cg_save(r, ins)?,
        }
        Ok(())
    }

    fn cg_sload(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return; // dead
        }
        let slot = IrBuffer::sload_slot(ins);
        let d = self.dest_reg(r);
        let disp = slot * 8;
        dynasm!(self.asm; mov Rq(d), [rbp + disp]);
        self.store_result(r, d);
    }

    fn cg_fref(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        self.load_ref(WR0, ins.op1());
        let d = self.dest_reg(r);
        let disp = ins.op2() as i32 * 8;
        dynasm!(self.asm; lea Rq(d), [Rq(WR0) + disp]);
        self.store_result(r, d);
    }

    fn cg_fload(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        self.load_ref(WR0, ins.op1());
        let d = self.dest_reg(r);
        dynasm!(self.asm; mov Rq(d), [Rq(WR0)]);
        self.store_result(r, d);
    }

    fn cg_pload(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        self.load_ref(WR0, ins.op1());
        self.load_ref(WR1, ins.op2());
        let d = self.dest_reg(r);
        dynasm!(self.asm; mov Rq(d), [Rq(WR0) + Rq(WR1) * 8]);
        self.store_result(r, d);
    }

    fn cg_unop(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        let d = self.dest_reg(r);
        self.load_ref(d, ins.op1());
        match ins.opcode() {
            Opcode::Neg => dynasm!(self.asm; neg Rq(d)),
            _ => dynasm!(self.asm; not Rq(d)),
        }
        self.store_result(r, d);
    }

    fn cg_binop(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        let d = self.dest_reg(r);
        // Second operand first: the destination may currently hold it.
        self.load_ref(WR1, ins.op2());
        self.load_ref(d, ins.op1());
        match ins.opcode() {
            Opcode::Add => dynasm!(self.asm; add Rq(d), Rq(WR1)),
            Opcode::Sub => dynasm!(self.asm; sub Rq(d), Rq(WR1)),
            Opcode::Band => dynasm!(self.asm; and Rq(d), Rq(WR1)),
            Opcode::Bor => dynasm!(self.asm; or Rq(d), Rq(WR1)),
            Opcode::Bxor => dynasm!(self.asm; xor Rq(d), Rq(WR1)),
            Opcode::Mul => dynasm!(self.asm; imul Rq(d), Rq(WR1)),
            _ => unreachable!(),
        }
        self.store_result(r, d);
    }

    fn cg_shift(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        let d = self.dest_reg(r);
        self.load_ref(super::RID_RCX, ins.op2());
        self.load_ref(d, ins.op1());
        match ins.opcode() {
            Opcode::Bshl => dynasm!(self.asm; shl Rq(d), cl),
            _ => dynasm!(self.asm; shr Rq(d), cl),
        }
        self.store_result(r, d);
    }

    fn cg_divrem(&mut self, r: IrRef, ins: &Ir) {
        if !self.buf.ir(r).has_home() {
            return;
        }
        // The dividend is hard-wired into rdx:rax.
        self.load_ref(WR1, ins.op2());
        self.load_ref(super::RID_RAX, ins.op1());
        dynasm!(self.asm
            ; cqo
            ; idiv Rq(WR1)
        );
        let res = if ins.opcode() == Opcode::Div {
            super::RID_RAX
        } else {
            super::RID_RDX
        };
        self.store_result(r, res);
    }

    fn cg_cmp_guard(&mut self, r: IrRef, ins: &Ir) {
        self.load_ref(WR0, ins.op1());
        self.load_ref(WR1, ins.op2());
        dynasm!(self.asm; cmp Rq(WR0), Rq(WR1));
        let l = self.exit_label(r);
        // Exit when the asserted condition does not hold.
        match ins.opcode() {
            Opcode::Lt => dynasm!(self.asm; jge =>l),
            Opcode::Ge => dynasm!(self.asm; jl =>l),
            Opcode::Le => dynasm!(self.asm; jg =>l),
            Opcode::Gt => dynasm!(self.asm; jle =>l),
            Opcode::Ult => dynasm!(self.asm; jae =>l),
            Opcode::Uge => dynasm!(self.asm; jb =>l),
            Opcode::Ule => dynasm!(self.asm; ja =>l),
            Opcode::Ugt => dynasm!(self.asm; jbe =>l),
            Opcode::Eq => dynasm!(self.asm; jne =>l),
            Opcode::Ne => dynasm!(self.asm; je =>l),
            _ => unreachable!(),
        }
    }

    fn cg_eqinfo(&mut self, r: IrRef, ins: &Ir) {
        self.load_ref(WR0, ins.op1());
        dynasm!(self.asm; mov Rq(WR0), [Rq(WR0)]);
        self.load_ref(WR1, ins.op2());
        dynasm!(self.asm; cmp Rq(WR0), Rq(WR1));
        let l = self.exit_label(r);
        dynasm!(self.asm; jne =>l);
    }

    fn cg_heapchk(&mut self, r: IrRef, ins: &Ir) {
        let words = ins.op1() as i32;
        if words == 0 {
            return; // every allocation in the group was sunk
        }
        let l = self.exit_label(r);
        let bump = words * 8;
        // The bump happens before the check so a failing exit carries the
        // bumped pointer; deoptimisation rewinds it by the same amount.
        dynasm!(self.asm
            ; add Rq(RID_HP), bump
            ; cmp Rq(RID_HP), [rsp + FRAME_HPLIM]
            ; ja =>l
        );
    }

    fn cg_new(&mut self, r: IrRef, ins: &Ir) {
        let entry = self.buf.heap.entry(ins.op2());
        if entry.is_sunk() {
            return;
        }
        let disp = entry.hp_offs() * 8;
        dynasm!(self.asm; lea Rq(WR0), [Rq(RID_HP) + disp]);
        self.load_ref(WR1, ins.op1());
        dynasm!(self.asm; mov [Rq(WR0)], Rq(WR1));
        let fields: Vec<IrRef> = self.buf.heap.fields(ins.op2()).to_vec();
        for (i, f) in fields.iter().enumerate() {
            self.load_ref(WR1, *f);
            let off = (1 + i as i32) * 8;
            dynasm!(self.asm; mov [Rq(WR0) + off], Rq(WR1));
        }
        self.store_result(r, WR0);
    }

    fn cg_update(&mut self, ins: &Ir) {
        self.load_ref(WR0, ins.op1());
        let ind = misc_closures().indirection_info().as_word() as i64;
        dynasm!(self.asm
            ; mov Rq(WR1), QWORD ind
            ; mov [Rq(WR0)], Rq(WR1)
        );
        self.load_ref(WR1, ins.op2());
        dynasm!(self.asm; mov [Rq(WR0) + 8], Rq(WR1));
    }

    fn cg_save(&mut self, r: IrRef, ins: &Ir) -> Result<(), CompilationError> {
        if ins.op1() == SAVE_LOOP && self.buf.nloop != 0 {
            // Unrolled loop: move the loop-carried values into their
            // first-iteration homes, then jump to the loop body.
            self.emit_phi_moves()?;
            let l = self.loop_label;
            dynasm!(self.asm; jmp =>l);
            return Ok(());
        }

        // Write the snapshot back to the concrete stack; the exit path (or
        // the re-entered loop body) then sees plain interpreter state.
        let sn = self.snap_of[&r];
        self.emit_snapshot_writeback(sn);

        if ins.op1() == SAVE_LOOP {
            let l = self.entry_label;
            dynasm!(self.asm; jmp =>l);
        } else {
            let l = self.exit_labels[sn as usize];
            dynasm!(self.asm; jmp =>l);
        }
        Ok(())
    }

    fn emit_snapshot_writeback(&mut self, sn: u32) {
        let snap = &self.buf.snaps()[sn as usize];
        let entries: Vec<SnapEntry> = self.buf.snapmap()[snap.map_range()].to_vec();
        for e in entries {
            self.load_ref(WR0, e.ref_());
            let disp = e.slot() as i32 * 8;
            dynasm!(self.asm; mov [rbp + disp], Rq(WR0));
        }
    }

    fn emit_phi_moves(&mut self) -> Result<(), CompilationError> {
        let mut moves: Vec<(Loc, Loc)> = Vec::new();
        let mut imm_moves: Vec<(Loc, i64)> = Vec::new();
        let mut r = self.buf.chain_head(Opcode::Phi);
        while r != 0 {
            let ins = self.buf.ir(r);
            let lhs = ins.op1();
            let rhs = ins.op2();
            let dst = home_loc(self.buf, lhs).ok_or_else(|| {
                CompilationError::InternalError("phi lhs without a home".into())
            })?;
            if irref_is_literal(rhs) {
                imm_moves.push((dst, self.buf.literal_value(rhs, 0) as i64));
            } else {
                let src = home_loc(self.buf, rhs).ok_or_else(|| {
                    CompilationError::InternalError("phi rhs without a home".into())
                })?;
                moves.push((dst, src));
            }
            r = ins.prev();
        }
        let ops = parmove::resolve(&moves, Some(WR0))
            .map_err(|e| CompilationError::InternalError(e.to_string()))?;
        for op in ops {
            self.lower_move(op);
        }
        for (dst, v) in imm_moves {
            match dst {
                Loc::Reg(d) => dynasm!(self.asm; mov Rq(d), QWORD v),
                Loc::Spill(s) => {
                    let off = spill_off(s as u8);
                    dynasm!(self.asm
                        ; mov Rq(WR0), QWORD v
                        ; mov [rsp + off], Rq(WR0)
                    );
                }
            }
        }
        Ok(())
    }

    fn lower_move(&mut self, op: MoveOp) {
        match op {
            MoveOp::Copy { dst: Loc::Reg(d), src: Loc::Reg(s) } => {
                dynasm!(self.asm; mov Rq(d), Rq(s));
            }
            MoveOp::Copy { dst: Loc::Reg(d), src: Loc::Spill(s) } => {
                let off = spill_off(s as u8);
                dynasm!(self.asm; mov Rq(d), [rsp + off]);
            }
            MoveOp::Copy { dst: Loc::Spill(d), src: Loc::Reg(s) } => {
                let off = spill_off(d as u8);
                dynasm!(self.asm; mov [rsp + off], Rq(s));
            }
            MoveOp::Copy { dst: Loc::Spill(_), src: Loc::Spill(_) } => {
                unreachable!("resolver never emits memory-to-memory moves")
            }
            MoveOp::Swap { a, b } => {
                dynasm!(self.asm; xchg Rq(a), Rq(b));
            }
        }
    }
}

fn home_loc(buf: &IrBuffer, r: IrRef) -> Option<Loc> {
    let ins = buf.ir(r);
    if ins.reg() != RID_NONE {
        Some(Loc::Reg(ins.reg()))
    } else if ins.spill() != 0 {
        Some(Loc::Spill(ins.spill() as u16))
    } else {
        None
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::jit::ir::{tests::test_buffer, IrType, TyBits, SAVE_FALLTHROUGH};

    fn run(buf: &mut IrBuffer, base: *mut Word) -> (u32, Box<ExitState>) {
        let code = codegen(buf).unwrap();
        let mut es = Box::new(ExitState::new());
        let exit =
            unsafe { code.enter(&mut *es, base, std::ptr::null_mut(), std::ptr::null_mut()) };
        (exit, es)
    }

    #[test]
    fn identity_move() {
        let (mut buf, mut stack) = test_buffer();
        stack[12] = 1234; // slot 1 of the frame based at index 11
        let t = buf.slot(1);
        buf.set_slot(0, t);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            SAVE_FALLTHROUGH,
            0,
        );
        let base = &mut stack[11] as *mut Word;
        let (exit, _es) = run(&mut buf, base);
        assert_eq!(exit, 0);
        assert_eq!(stack[11], 1234);
    }

    #[test]
    fn add_chain_writes_slots_back() {
        let (mut buf, mut stack) = test_buffer();
        stack[11] = 7;
        let tr1 = buf.slot(0);
        let k = buf.literal(IrType::I64, 1234);
        let t1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), tr1.ref_(), k.ref_())
            .unwrap();
        let t2 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), t1.ref_(), k.ref_())
            .unwrap();
        buf.set_slot(0, t2);
        buf.set_slot(1, k);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            SAVE_FALLTHROUGH,
            0,
        );
        let base = &mut stack[11] as *mut Word;
        let (exit, _es) = run(&mut buf, base);
        assert_eq!(exit, 0);
        assert_eq!(stack[11], 1234 + 1234 + 7);
        assert_eq!(stack[12], 1234);
    }

    #[test]
    fn wide_literals_survive() {
        let (mut buf, mut stack) = test_buffer();
        stack[11] = 7;
        let lit = 0x5_0000_1234usize as Word;
        let tr1 = buf.slot(0);
        let k = buf.literal(IrType::I64, lit);
        let t1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), tr1.ref_(), k.ref_())
            .unwrap();
        buf.set_slot(0, t1);
        buf.set_slot(1, k);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            SAVE_FALLTHROUGH,
            0,
        );
        let base = &mut stack[11] as *mut Word;
        let (exit, _) = run(&mut buf, base);
        assert_eq!(exit, 0);
        assert_eq!(stack[11], lit + 7);
        assert_eq!(stack[12], lit);
    }

    #[test]
    fn guard_exit_returns_its_exit_number() {
        let (mut buf, mut stack) = test_buffer();
        stack[11] = 10;
        let tr1 = buf.slot(0);
        let five = buf.literal(IrType::I64, 5);
        buf.emit_raw(
            Opcode::Lt,
            TyBits::guarded(IrType::Void),
            tr1.ref_(),
            five.ref_(),
        );
        let t = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), tr1.ref_(), five.ref_())
            .unwrap();
        buf.set_slot(0, t);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            SAVE_FALLTHROUGH,
            0,
        );
        let base = &mut stack[11] as *mut Word;
        // 10 < 5 fails: exit 0 (the guard's snapshot).
        let (exit, es) = run(&mut buf, base);
        assert_eq!(exit, 0);
        // The guarded value is observable in the exit state.
        let home = buf.ir(tr1.ref_());
        assert!(home.reg() != RID_NONE);
        assert_eq!(es.gpr[home.reg() as usize], 10);
        // 4 < 5 holds: the trace runs to its end (exit 1).
        stack[11] = 4;
        let (exit, _) = run(&mut buf, base);
        assert_eq!(exit, 1);
        assert_eq!(stack[11], 9);
    }

    #[test]
    fn division_and_remainder_are_signed() {
        let (mut buf, mut stack) = test_buffer();
        stack[11] = 1_700_000_000_001u64 as Word;
        stack[12] = (-500_000_001i64) as Word;
        let a = buf.slot(0);
        let b = buf.slot(1);
        let q = buf
            .emit(Opcode::Div, TyBits::plain(IrType::I64), a.ref_(), b.ref_())
            .unwrap();
        let m = buf
            .emit(Opcode::Rem, TyBits::plain(IrType::I64), a.ref_(), b.ref_())
            .unwrap();
        buf.set_slot(0, q);
        buf.set_slot(1, m);
        buf.emit_raw(
            Opcode::Save,
            TyBits::guarded(IrType::Void),
            SAVE_FALLTHROUGH,
            0,
        );
        let base = &mut stack[11] as *mut Word;
        let (exit, _) = run(&mut buf, base);
        assert_eq!(exit, 0);
        assert_eq!(stack[11] as i64, 1_700_000_000_001i64 / -500_000_001);
        assert_eq!(stack[12] as i64, 1_700_000_000_001i64 % -500_000_001);
    }

    #[test]
    fn countdown_loop_runs_to_completion() {
        // f(x, y) = if y > 0 then f(x + 5, y - 1) else (x, y)
        let (mut buf, mut stack) = test_buffer();
        stack[11] = 0; // x
        stack[12] = 5; // y
        let x = buf.slot(0);
        let y = buf.slot(1);
        let five = buf.literal(IrType::I64, 5);
        let one = buf.literal(IrType::I64, 1);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(
            Opcode::Gt,
            TyBits::guarded(IrType::Void),
            y.ref_(),
            zero.ref_(),
        );
        let x1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), five.ref_())
            .unwrap();
        buf.set_slot(0, x1);
        let y1 = buf
            .emit(Opcode::Sub, TyBits::plain(IrType::I64), y.ref_(), one.ref_())
            .unwrap();
        buf.set_slot(1, y1);
        buf.emit_raw(Opcode::Save, TyBits::guarded(IrType::Void), SAVE_LOOP, 0);

        let base = &mut stack[11] as *mut Word;
        let (exit, _) = run(&mut buf, base);
        // The loop iterates in machine code until the guard fails.
        assert_eq!(exit, 0);
        assert_eq!(stack[11], 25);
        assert_eq!(stack[12], 0);
    }

    #[test]
    fn unrolled_loop_carries_values_in_registers() {
        use crate::jit::opt;
        let (mut buf, mut stack) = test_buffer();
        stack[11] = 0;
        stack[12] = 7;
        let x = buf.slot(0);
        let y = buf.slot(1);
        let five = buf.literal(IrType::I64, 5);
        let one = buf.literal(IrType::I64, 1);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(
            Opcode::Gt,
            TyBits::guarded(IrType::Void),
            y.ref_(),
            zero.ref_(),
        );
        let x1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), x.ref_(), five.ref_())
            .unwrap();
        buf.set_slot(0, x1);
        let y1 = buf
            .emit(Opcode::Sub, TyBits::plain(IrType::I64), y.ref_(), one.ref_())
            .unwrap();
        buf.set_slot(1, y1);
        opt::unroll_loop(&mut buf).unwrap();
        buf.emit_raw(Opcode::Save, TyBits::guarded(IrType::Void), SAVE_LOOP, 0);

        let base = &mut stack[11] as *mut Word;
        let (exit, es) = run(&mut buf, base);
        // The loop spins in the replayed body until its guard (exit 1)
        // fires with y exhausted.
        assert_eq!(exit, 1);
        // x accumulated 7 * 5 in the loop-carried home of its PHI.
        let home = buf.ir(x1.ref_());
        assert!(home.reg() != RID_NONE);
        assert_eq!(es.gpr[home.reg() as usize], 35);
    }
}
