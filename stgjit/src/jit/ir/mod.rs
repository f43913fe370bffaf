//! The trace IR and its buffer.
//!
//! The IR is a two-ended array of 64-bit instructions addressed by *biased*
//! 16-bit references: literals grow downwards from [REF_BIAS], regular
//! instructions upwards. A reference below the bias is therefore a literal
//! and can be rematerialised at any point; a reference at or above it names
//! an instruction, and instructions only ever refer to strictly earlier
//! references.
//!
//! Each opcode has a chain head threading through all instructions of that
//! opcode (newest first) via the `prev` field; the fold engine walks these
//! chains for CSE and literal interning. After recording, `prev` is dead and
//! is reused by the register allocator to hold the instruction's home
//! `(spill, reg)` pair, which the deoptimiser later reads.

pub mod fold;
pub mod heap;
pub mod snapshot;

use crate::{
    jit::TraceError,
    vm::{Word, WORD_SIZE},
};
use heap::AbstractHeap;
use snapshot::{SnapEntry, Snapshot};
use static_assertions::const_assert;
use std::fmt;
use strum::{EnumCount, FromRepr};

/// A biased IR reference.
pub type IrRef = u16;

/// The bias: literal references are below, instruction references at or
/// above.
pub const REF_BIAS: IrRef = 0x8000;

/// The reference of the `BASE` pseudo-instruction (the trace entry base
/// pointer).
pub const REF_BASE: IrRef = REF_BIAS;

/// The first real instruction reference.
pub const REF_FIRST: IrRef = REF_BIAS + 1;

/// Is `r` a literal reference?
pub fn irref_is_literal(r: IrRef) -> bool {
    r < REF_BIAS
}

/// An IR opcode.
///
/// Comparison opcodes are laid out in inverse pairs so a comparison can be
/// flipped by toggling the low discriminant bit.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumCount, FromRepr)]
pub enum Opcode {
    Nop = 0,
    /// The entry base pointer.
    Base,
    /// Start of the unrolled loop body.
    Loop,
    /// Loop-carried value: op1 = first-iteration ref, op2 = value at the
    /// loop backedge.
    Phi,
    /// 32-bit-encodable literal; payload in op1|op2.
    Kint,
    /// Word literal; op1 indexes the constant word pool.
    Kword,
    /// Literal relative to the entry base; payload is a signed word offset.
    Kbaseo,
    /// Stack slot load; op1 = slot index relative to the entry base
    /// (biased by [SLOT_BIAS]), op2 = flags.
    Sload,
    /// Field address: op1 = object ref, op2 = word offset.
    Fref,
    /// Load through a field address.
    Fload,
    /// Load a word from pointer op1 offset by op2 words (both refs).
    Pload,
    /// Integer negation.
    Neg,
    // Comparison guards; each even/odd pair are mutual inverses.
    Lt = 12,
    Ge,
    Le,
    Gt,
    Ult,
    Uge,
    Ule,
    Ugt,
    Eq = 20,
    Ne,
    /// Guard that op1's info-table word equals literal op2.
    EqInfo,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Band,
    Bor,
    Bxor,
    Bnot,
    Bshl,
    Bshr,
    /// Allocate; op1 = info-table ref, op2 = abstract heap entry index.
    New,
    /// Overwrite closure op1 with an indirection to op2.
    Update,
    /// Reserve op1 words of heap, exiting to the snapshot on exhaustion.
    HeapChk,
    /// Trace end; op1 = [SAVE_LOOP]/[SAVE_FALLTHROUGH]/[SAVE_LINK],
    /// op2 = linked trace id for [SAVE_LINK].
    Save,
}

pub const SAVE_LOOP: u16 = 1;
pub const SAVE_FALLTHROUGH: u16 = 2;
pub const SAVE_LINK: u16 = 3;

/// `SLOAD` slot indices are signed; bias them into the u16 operand field.
pub const SLOT_BIAS: u16 = 0x1000;

impl Opcode {
    pub fn is_comparison(self) -> bool {
        (Opcode::Lt as u8..=Opcode::Ne as u8).contains(&(self as u8))
    }

    /// The inverse comparison.
    ///
    /// # Panics
    ///
    /// Panics if the opcode is not a comparison.
    pub fn inverted(self) -> Opcode {
        debug_assert!(self.is_comparison());
        Opcode::from_repr(self as u8 ^ 1).unwrap()
    }

    pub fn is_literal_op(self) -> bool {
        matches!(self, Opcode::Kint | Opcode::Kword | Opcode::Kbaseo)
    }

    /// Side-effecting instructions are never removed, CSE'd or reordered
    /// across guards.
    pub fn has_side_effect(self) -> bool {
        matches!(self, Opcode::Update | Opcode::Save)
    }

    /// Does the instruction write memory the trace may later re-read?
    pub fn is_store(self) -> bool {
        matches!(self, Opcode::Update)
    }

    pub fn is_load(self) -> bool {
        matches!(self, Opcode::Fload | Opcode::Pload | Opcode::Sload)
    }

    /// May the fold engine CSE this opcode over its chain?
    pub fn is_cseable(self) -> bool {
        self.is_comparison()
            || matches!(
                self,
                Opcode::EqInfo
                    | Opcode::Add
                    | Opcode::Sub
                    | Opcode::Mul
                    | Opcode::Div
                    | Opcode::Rem
                    | Opcode::Neg
                    | Opcode::Band
                    | Opcode::Bor
                    | Opcode::Bxor
                    | Opcode::Bnot
                    | Opcode::Bshl
                    | Opcode::Bshr
                    | Opcode::Fref
                    | Opcode::Fload
                    | Opcode::Pload
            )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::Band | Opcode::Bor | Opcode::Bxor
        ) || matches!(self, Opcode::Eq | Opcode::Ne)
    }

    /// Which of (op1, op2) are IR references (as opposed to immediates,
    /// slot numbers or table indices)?
    pub fn ref_operands(self) -> (bool, bool) {
        match self {
            Opcode::Nop
            | Opcode::Base
            | Opcode::Loop
            | Opcode::Kint
            | Opcode::Kword
            | Opcode::Kbaseo
            | Opcode::Sload
            | Opcode::HeapChk
            | Opcode::Save => (false, false),
            Opcode::Neg | Opcode::Bnot | Opcode::Fload | Opcode::Fref => (true, false),
            Opcode::New => (true, false),
            _ => (true, true),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Base => "base",
            Opcode::Loop => "loop",
            Opcode::Phi => "phi",
            Opcode::Kint => "kint",
            Opcode::Kword => "kword",
            Opcode::Kbaseo => "kbaseo",
            Opcode::Sload => "sload",
            Opcode::Fref => "fref",
            Opcode::Fload => "fload",
            Opcode::Pload => "pload",
            Opcode::Neg => "neg",
            Opcode::Lt => "lt",
            Opcode::Ge => "ge",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ult => "ult",
            Opcode::Uge => "uge",
            Opcode::Ule => "ule",
            Opcode::Ugt => "ugt",
            Opcode::Eq => "eq",
            Opcode::Ne => "ne",
            Opcode::EqInfo => "eqinfo",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::Band => "band",
            Opcode::Bor => "bor",
            Opcode::Bxor => "bxor",
            Opcode::Bnot => "bnot",
            Opcode::Bshl => "bshl",
            Opcode::Bshr => "bshr",
            Opcode::New => "new",
            Opcode::Update => "update",
            Opcode::HeapChk => "heapchk",
            Opcode::Save => "save",
        }
    }
}

/// An IR value type. The guard flag is orthogonal and lives in [TyBits].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
pub enum IrType {
    I32 = 0,
    I64,
    U32,
    U64,
    Chr,
    Ptr,
    Clos,
    Info,
    Pc,
    F32,
    Void,
    Unknown,
}

impl IrType {
    pub fn is_signed(self) -> bool {
        matches!(self, IrType::I32 | IrType::I64)
    }
}

const TY_GUARD: u8 = 0x80;
const TY_MASK: u8 = 0x1f;

/// A type byte: an [IrType] plus the guard flag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TyBits(u8);

impl TyBits {
    pub fn plain(ty: IrType) -> Self {
        TyBits(ty as u8)
    }

    pub fn guarded(ty: IrType) -> Self {
        TyBits(ty as u8 | TY_GUARD)
    }

    pub fn from_raw(t: u8) -> Self {
        TyBits(t)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn ty(self) -> IrType {
        IrType::from_repr(self.0 & TY_MASK).unwrap()
    }

    pub fn is_guard(self) -> bool {
        self.0 & TY_GUARD != 0
    }
}

/// Register/spill sentinel: no register assigned.
pub const RID_NONE: u8 = 0xff;

/// A single IR instruction: a 64-bit record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Ir {
    op: u8,
    t: u8,
    op1: u16,
    op2: u16,
    /// During recording: previous instruction of the same opcode (CSE
    /// chain). After register allocation: `(spill << 8) | reg`.
    prev: u16,
}

const_assert!(std::mem::size_of::<Ir>() == 8);

impl Ir {
    pub fn new(op: Opcode, t: TyBits, op1: u16, op2: u16) -> Self {
        Ir {
            op: op as u8,
            t: t.raw(),
            op1,
            op2,
            prev: 0,
        }
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from_repr(self.op).unwrap()
    }

    pub fn set_opcode(&mut self, op: Opcode) {
        self.op = op as u8;
    }

    pub fn tybits(&self) -> TyBits {
        TyBits(self.t)
    }

    pub fn ty(&self) -> IrType {
        self.tybits().ty()
    }

    pub fn is_guard(&self) -> bool {
        self.tybits().is_guard()
    }

    pub fn op1(&self) -> u16 {
        self.op1
    }

    pub fn op2(&self) -> u16 {
        self.op2
    }

    pub fn set_op1(&mut self, v: u16) {
        self.op1 = v;
    }

    pub fn set_op2(&mut self, v: u16) {
        self.op2 = v;
    }

    pub fn prev(&self) -> IrRef {
        self.prev
    }

    pub fn set_prev(&mut self, prev: IrRef) {
        self.prev = prev;
    }

    /// The 32-bit payload of `KINT`/`KBASEO`.
    pub fn i32v(&self) -> i32 {
        ((self.op1 as u32) | ((self.op2 as u32) << 16)) as i32
    }

    // After register allocation `prev` holds the home location.

    pub fn init_home(&mut self) {
        self.prev = RID_NONE as u16;
    }

    pub fn reg(&self) -> u8 {
        (self.prev & 0xff) as u8
    }

    pub fn set_reg(&mut self, reg: u8) {
        self.prev = (self.prev & 0xff00) | reg as u16;
    }

    pub fn spill(&self) -> u8 {
        (self.prev >> 8) as u8
    }

    pub fn set_spill(&mut self, spill: u8) {
        self.prev = (self.prev & 0x00ff) | ((spill as u16) << 8);
    }

    pub fn has_home(&self) -> bool {
        self.reg() != RID_NONE || self.spill() != 0
    }
}

const TREF_REF_MASK: u32 = 0xffff;
const TREF_WRITTEN: u32 = 1 << 24;

/// A tagged reference: an IR reference plus its type, plus a *written* bit
/// used by the snapshot engine to distinguish slots the trace wrote from
/// slots it merely read.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TRef(u32);

impl TRef {
    pub fn none() -> Self {
        TRef(0)
    }

    pub fn new(r: IrRef, ty: IrType) -> Self {
        TRef(r as u32 | ((ty as u32) << 16))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn ref_(self) -> IrRef {
        (self.0 & TREF_REF_MASK) as IrRef
    }

    pub fn ty(self) -> IrType {
        IrType::from_repr(((self.0 >> 16) & 0xff) as u8).unwrap()
    }

    pub fn is_literal(self) -> bool {
        !self.is_none() && irref_is_literal(self.ref_())
    }

    pub fn written(self) -> Self {
        TRef(self.0 | TREF_WRITTEN)
    }

    pub fn is_written(self) -> bool {
        self.0 & TREF_WRITTEN != 0
    }
}

/// Geometry of the abstract slot array.
pub const SLOTS_LEN: usize = 512;
pub const INITIAL_BASE: usize = 128;
pub const MAX_SLOTS: usize = 200;

/// The abstract contents of the VM stack during recording.
///
/// Indices are *absolute* positions within the array; the entry base sits at
/// [INITIAL_BASE] and slot addresses are translated against the recorded
/// start base address. Invariants: `min_slot <= base <= top` and
/// `top - base <= MAX_SLOTS`.
pub struct AbstractSlots {
    refs: Vec<TRef>,
    /// Absolute index of slot 0 of the current virtual frame.
    base: usize,
    /// Absolute index one past the current virtual frame.
    top: usize,
    /// Lowest absolute index touched (the running minimum; pushing it below
    /// the array floor is a recording abort, not a crash).
    min_slot: usize,
    /// Highest absolute index touched (inclusive).
    max_slot: usize,
    /// Address of the entry base slot.
    start_base: Word,
}

impl AbstractSlots {
    fn new() -> Self {
        AbstractSlots {
            refs: vec![TRef::none(); SLOTS_LEN],
            base: INITIAL_BASE,
            top: INITIAL_BASE,
            min_slot: INITIAL_BASE,
            max_slot: INITIAL_BASE,
            start_base: 0,
        }
    }

    fn reset(&mut self, base_addr: Word, top_addr: Word) {
        self.refs.iter_mut().for_each(|r| *r = TRef::none());
        self.base = INITIAL_BASE;
        self.top = INITIAL_BASE + (top_addr - base_addr) / WORD_SIZE;
        self.min_slot = INITIAL_BASE;
        self.max_slot = self.top;
        self.start_base = base_addr;
    }

    /// Absolute index of `slot` relative to the current base.
    pub fn absolute(&self, slot: i32) -> usize {
        (self.base as i64 + slot as i64) as usize
    }

    /// Translate a slot address from the concrete stack into an absolute
    /// index.
    fn absolute_addr(&self, addr: Word) -> i64 {
        INITIAL_BASE as i64 + (addr as i64 - self.start_base as i64) / WORD_SIZE as i64
    }

    pub fn start_base(&self) -> Word {
        self.start_base
    }

    pub fn get(&self, slot: i32) -> TRef {
        self.refs[self.absolute(slot)]
    }

    fn set(&mut self, slot: i32, t: TRef) {
        let abs = self.absolute(slot);
        self.refs[abs] = t;
        if !t.is_none() {
            self.min_slot = self.min_slot.min(abs);
            self.max_slot = self.max_slot.max(abs);
        }
    }

    /// Move the virtual frame. Overflowing the array in either direction is
    /// a recording abort.
    pub fn frame(&mut self, base_addr: Word, top_addr: Word) -> Result<(), TraceError> {
        let base = self.absolute_addr(base_addr);
        let top = self.absolute_addr(top_addr);
        // A frame header of three slots must fit below the base.
        if base < 3 || base > top || top as usize >= SLOTS_LEN || (top - base) as usize > MAX_SLOTS
        {
            return Err(TraceError::AbstractStackOverflow);
        }
        self.base = base as usize;
        self.top = top as usize;
        self.min_slot = self.min_slot.min(self.base);
        self.max_slot = self.max_slot.max(self.top);
        Ok(())
    }

    /// The current frame's top, as a slot index relative to base.
    pub fn top_slot(&self) -> i32 {
        (self.top - self.base) as i32
    }

    /// The virtual base's word offset from the entry base.
    pub fn relbase(&self) -> i32 {
        self.base as i32 - INITIAL_BASE as i32
    }

    /// The highest touched slot relative to the entry base; this is the
    /// frame size the compiled trace needs.
    pub fn highest_slot(&self) -> u16 {
        (self.max_slot - INITIAL_BASE.min(self.max_slot)) as u16
    }

    pub fn min_abs(&self) -> usize {
        self.min_slot
    }

    pub fn max_abs(&self) -> usize {
        self.max_slot
    }

    pub fn base_abs(&self) -> usize {
        self.base
    }
}

/// Optimisation toggles for the buffer-level fold engine.
#[derive(Clone, Copy)]
pub struct BufOpts {
    pub fold: bool,
    pub cse: bool,
}

impl Default for BufOpts {
    fn default() -> Self {
        BufOpts { fold: true, cse: true }
    }
}

/// The two-ended IR buffer.
pub struct IrBuffer {
    /// Instructions; `insts[i]` is reference `REF_BASE + i`.
    insts: Vec<Ir>,
    /// Literals; `consts[i]` is reference `REF_BIAS - 1 - i`.
    consts: Vec<Ir>,
    /// Word pool for `KWORD` literals.
    kwords: Vec<Word>,
    /// Per-opcode chain heads (0 = empty).
    chain: [IrRef; Opcode::COUNT],
    pub slots: AbstractSlots,
    pub(crate) snaps: Vec<Snapshot>,
    pub(crate) snapmap: Vec<SnapEntry>,
    pub heap: AbstractHeap,
    pub opts: BufOpts,
    /// Bytecode PC of the instruction currently being recorded; captured
    /// into snapshots.
    pub pc: Word,
    /// Highest reference (exclusive) with a guard at or after which CSE must
    /// stop.
    pub(crate) cse_limit: IrRef,
    /// Like `cse_limit`, but only bumped by stores; limits load forwarding.
    pub(crate) load_limit: IrRef,
    /// Set by `set_slot`; forces the next guard to take a fresh snapshot.
    pub(crate) slots_modified: bool,
    /// Reference of the `LOOP` marker, or 0.
    pub nloop: IrRef,
    /// Reference of the last emitted `HEAPCHK`, or 0.
    pub(crate) last_heapchk: IrRef,
}

impl IrBuffer {
    pub fn new() -> Self {
        let mut buf = IrBuffer {
            insts: Vec::new(),
            consts: Vec::new(),
            kwords: Vec::new(),
            chain: [0; Opcode::COUNT],
            slots: AbstractSlots::new(),
            snaps: Vec::new(),
            snapmap: Vec::new(),
            heap: AbstractHeap::new(),
            opts: BufOpts::default(),
            pc: 0,
            cse_limit: REF_FIRST,
            load_limit: REF_FIRST,
            slots_modified: false,
            nloop: 0,
            last_heapchk: 0,
        };
        buf.insts
            .push(Ir::new(Opcode::Base, TyBits::plain(IrType::Ptr), 0, 0));
        buf
    }

    /// Reinitialise for a fresh recording over the given concrete frame.
    pub fn reset(&mut self, base_addr: Word, top_addr: Word) {
        self.insts.clear();
        self.insts
            .push(Ir::new(Opcode::Base, TyBits::plain(IrType::Ptr), 0, 0));
        self.consts.clear();
        self.kwords.clear();
        self.chain = [0; Opcode::COUNT];
        self.slots.reset(base_addr, top_addr);
        self.snaps.clear();
        self.snapmap.clear();
        self.heap.reset();
        self.pc = 0;
        self.cse_limit = REF_FIRST;
        self.load_limit = REF_FIRST;
        self.slots_modified = false;
        self.nloop = 0;
        self.last_heapchk = 0;
    }

    /// Lowest live reference.
    pub fn bufmin(&self) -> IrRef {
        REF_BIAS - self.consts.len() as IrRef
    }

    /// One past the highest instruction reference.
    pub fn bufmax(&self) -> IrRef {
        REF_BASE + self.insts.len() as IrRef
    }

    /// Total number of instructions and literals (not counting `BASE`).
    pub fn size(&self) -> usize {
        self.insts.len() - 1 + self.consts.len()
    }

    pub fn ir(&self, r: IrRef) -> &Ir {
        if r >= REF_BIAS {
            &self.insts[(r - REF_BIAS) as usize]
        } else {
            &self.consts[(REF_BIAS - 1 - r) as usize]
        }
    }

    pub fn ir_mut(&mut self, r: IrRef) -> &mut Ir {
        if r >= REF_BIAS {
            &mut self.insts[(r - REF_BIAS) as usize]
        } else {
            &mut self.consts[(REF_BIAS - 1 - r) as usize]
        }
    }

    pub fn chain_head(&self, op: Opcode) -> IrRef {
        self.chain[op as usize]
    }

    pub fn kword(&self, idx: u16) -> Word {
        self.kwords[idx as usize]
    }

    pub fn kwords(&self) -> &[Word] {
        &self.kwords
    }

    /// Append an instruction without optimisation. Guard-flagged emissions
    /// capture a snapshot of the abstract state first.
    pub fn emit_raw(&mut self, op: Opcode, t: TyBits, op1: u16, op2: u16) -> TRef {
        if t.is_guard() {
            self.snapshot();
        }
        let r = self.bufmax();
        let mut ins = Ir::new(op, t, op1, op2);
        ins.set_prev(self.chain[op as usize]);
        self.chain[op as usize] = r;
        self.insts.push(ins);
        if t.is_guard() || op.has_side_effect() {
            self.cse_limit = r + 1;
        }
        if op.is_store() {
            self.load_limit = r + 1;
        }
        if op == Opcode::Loop {
            self.nloop = r;
        }
        TRef::new(r, t.ty())
    }

    /// Emit through the fold/CSE engine. The returned reference is
    /// semantically equivalent to the requested operation; it may be an
    /// existing instruction or a folded literal, and a guard proven to hold
    /// is dropped entirely (returning [TRef::none]). A guard proven to fail
    /// aborts recording.
    pub fn emit(
        &mut self,
        op: Opcode,
        t: TyBits,
        op1: u16,
        op2: u16,
    ) -> Result<TRef, TraceError> {
        fold::fold_emit(self, op, t, op1, op2)
    }

    fn push_const(&mut self, op: Opcode, ty: IrType, op1: u16, op2: u16) -> TRef {
        let r = self.bufmin() - 1;
        let mut ins = Ir::new(op, TyBits::plain(ty), op1, op2);
        ins.set_prev(self.chain[op as usize]);
        self.chain[op as usize] = r;
        self.consts.push(ins);
        TRef::new(r, ty)
    }

    /// Intern a typed literal. Equal (type, value) pairs share a reference.
    pub fn literal(&mut self, ty: IrType, val: Word) -> TRef {
        let fits32 = if ty.is_signed() {
            val as i64 as i32 as i64 == val as i64
        } else {
            val <= u32::MAX as Word
        };
        if fits32 {
            let payload = val as u32;
            let mut r = self.chain[Opcode::Kint as usize];
            while r != 0 {
                let ins = self.ir(r);
                if ins.ty() == ty && ins.i32v() as u32 == payload {
                    return TRef::new(r, ty);
                }
                r = ins.prev();
            }
            self.push_const(
                Opcode::Kint,
                ty,
                (payload & 0xffff) as u16,
                (payload >> 16) as u16,
            )
        } else {
            let mut r = self.chain[Opcode::Kword as usize];
            while r != 0 {
                let ins = self.ir(r);
                if ins.ty() == ty && self.kwords[ins.op1() as usize] == val {
                    return TRef::new(r, ty);
                }
                r = ins.prev();
            }
            self.kwords.push(val);
            let idx = (self.kwords.len() - 1) as u16;
            self.push_const(Opcode::Kword, ty, idx, 0)
        }
    }

    /// A literal pointer expressed relative to the entry base. Absolute
    /// stack addresses cannot be baked into code that is re-entered at
    /// different stack positions.
    pub fn base_literal(&mut self, addr: Word) -> TRef {
        let off = (addr as i64 - self.slots.start_base() as i64) / WORD_SIZE as i64;
        let off = off as i32;
        let payload = off as u32;
        let mut r = self.chain[Opcode::Kbaseo as usize];
        while r != 0 {
            let ins = self.ir(r);
            if ins.i32v() == off {
                return TRef::new(r, IrType::Ptr);
            }
            r = ins.prev();
        }
        self.push_const(
            Opcode::Kbaseo,
            IrType::Ptr,
            (payload & 0xffff) as u16,
            (payload >> 16) as u16,
        )
    }

    /// The concrete value of a literal reference. `base` is the address the
    /// entry base had (or has) for `KBASEO` resolution.
    pub fn literal_value(&self, r: IrRef, base: Word) -> Word {
        literal_value_in(self.ir(r), &self.kwords, base)
    }

    /// Read an abstract slot, lazily emitting an `SLOAD` for untouched
    /// slots.
    pub fn slot(&mut self, slot: i32) -> TRef {
        let cur = self.slots.get(slot);
        if !cur.is_none() {
            return cur;
        }
        let abs = self.slots.absolute(slot);
        let entry_rel = abs as i32 - INITIAL_BASE as i32;
        let op1 = (entry_rel + SLOT_BIAS as i32) as u16;
        let t = self.emit_raw(Opcode::Sload, TyBits::plain(IrType::Unknown), op1, 0);
        // A lazy load is not a write: the concrete slot already holds this
        // value, so snapshots need not capture it.
        self.slots.set(slot, t);
        t
    }

    /// Write an abstract slot.
    pub fn set_slot(&mut self, slot: i32, t: TRef) {
        let t = if t.is_none() { t } else { t.written() };
        self.slots.set(slot, t);
        self.slots_modified = true;
    }

    /// Move the virtual frame (see [AbstractSlots::frame]).
    pub fn frame(&mut self, base_addr: Word, top_addr: Word) -> Result<(), TraceError> {
        self.slots_modified = true;
        self.slots.frame(base_addr, top_addr)
    }

    /// The entry-base-relative slot index of an `SLOAD`.
    pub fn sload_slot(ins: &Ir) -> i32 {
        ins.op1() as i32 - SLOT_BIAS as i32
    }

    /// Reserve heap space for `words` words, merging into the previous
    /// heap check when no guard intervened.
    pub fn emit_heap_check(&mut self, words: u16) -> Result<(), TraceError> {
        if self.last_heapchk != 0 && self.cse_limit <= self.last_heapchk + 1 {
            let r = self.last_heapchk;
            let total = self.ir(r).op1() + words;
            self.ir_mut(r).set_op1(total);
            return Ok(());
        }
        let t = self.emit_raw(
            Opcode::HeapChk,
            TyBits::guarded(IrType::Void),
            words,
            0,
        );
        self.last_heapchk = t.ref_();
        Ok(())
    }

    /// Emit a symbolic allocation with `nfields` payload fields. The fields
    /// are recorded in the abstract heap, not as IR operands.
    pub fn emit_new(&mut self, itbl: TRef, nfields: u16) -> (TRef, u16) {
        let r = self.bufmax();
        let entry = self.heap.new_entry(itbl.ref_(), r, nfields);
        let t = self.emit_raw(Opcode::New, TyBits::plain(IrType::Clos), itbl.ref_(), entry);
        (t, entry)
    }

    /// Record field `i` of heap entry `entry`.
    pub fn set_field(&mut self, entry: u16, i: u16, r: TRef) {
        self.heap.set_field(entry, i, r.ref_());
    }

    pub fn snaps(&self) -> &[Snapshot] {
        &self.snaps
    }

    pub(crate) fn insts_slice(&self) -> &[Ir] {
        &self.insts
    }

    pub(crate) fn consts_slice(&self) -> &[Ir] {
        &self.consts
    }

    /// Find the snapshot belonging to the guard at `r`. The newest match
    /// wins: a stale same-ref snapshot can exist if slots changed between
    /// two captures with no instruction in between.
    pub fn snap_for(&self, r: IrRef) -> Option<usize> {
        self.snaps.iter().rposition(|s| s.ref_() == r)
    }

    /// Dump the buffer for debugging.
    pub fn debug_string(&self) -> String {
        format!("{}", self)
    }
}

/// Decode a literal instruction's value against a word pool and an entry
/// base address. Shared between the live buffer and frozen fragments.
pub(crate) fn literal_value_in(ins: &Ir, kwords: &[Word], base: Word) -> Word {
    match ins.opcode() {
        Opcode::Kint => {
            if ins.ty().is_signed() {
                ins.i32v() as i64 as Word
            } else {
                ins.i32v() as u32 as Word
            }
        }
        Opcode::Kword => kwords[ins.op1() as usize],
        Opcode::Kbaseo => (base as i64 + ins.i32v() as i64 * WORD_SIZE as i64) as Word,
        _ => unreachable!("not a literal: {:?}", ins.opcode()),
    }
}

pub(crate) fn fmt_ref(r: IrRef) -> String {
    if irref_is_literal(r) {
        format!("k{:03}", REF_BIAS - 1 - r)
    } else {
        format!("%{:03}", r - REF_BIAS)
    }
}

impl fmt::Display for IrBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in (0..self.consts.len()).rev() {
            let r = REF_BIAS - 1 - i as IrRef;
            let ins = self.ir(r);
            write!(f, "{} {:<7} {:?}", fmt_ref(r), ins.opcode().name(), ins.ty())?;
            match ins.opcode() {
                Opcode::Kint | Opcode::Kbaseo => writeln!(f, " {}", ins.i32v())?,
                Opcode::Kword => writeln!(f, " {:#x}", self.kwords[ins.op1() as usize])?,
                _ => writeln!(f)?,
            }
        }
        for i in 1..self.insts.len() {
            let r = REF_BASE + i as IrRef;
            let ins = self.ir(r);
            let g = if ins.is_guard() { ">" } else { " " };
            write!(f, "{} {}{:<7} {:?}", fmt_ref(r), g, ins.opcode().name(), ins.ty())?;
            let (r1, r2) = ins.opcode().ref_operands();
            if r1 {
                write!(f, " {}", fmt_ref(ins.op1()))?;
            } else if ins.opcode() == Opcode::Sload {
                write!(f, " #{}", Self::sload_slot(ins))?;
            } else {
                write!(f, " {}", ins.op1())?;
            }
            if r2 {
                write!(f, " {}", fmt_ref(ins.op2()))?;
            } else {
                write!(f, " {}", ins.op2())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_buffer() -> (IrBuffer, Vec<Word>) {
        let stack = vec![0 as Word; 64];
        let mut buf = IrBuffer::new();
        let base = &stack[11] as *const Word as Word;
        let top = &stack[18] as *const Word as Word;
        buf.reset(base, top);
        (buf, stack)
    }

    #[test]
    fn empty_buffer_has_base() {
        let (buf, _stack) = test_buffer();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.ir(REF_BASE).opcode(), Opcode::Base);
    }

    #[test]
    fn lazy_slot_load() {
        let (mut buf, _stack) = test_buffer();
        let tr = buf.slot(0);
        assert_eq!(tr.ref_(), REF_FIRST);
        assert_eq!(buf.size(), 1);
        assert_eq!(buf.ir(tr.ref_()).opcode(), Opcode::Sload);
        assert_eq!(IrBuffer::sload_slot(buf.ir(tr.ref_())), 0);
        // Reading again does not emit a second load.
        let tr2 = buf.slot(0);
        assert_eq!(tr.ref_(), tr2.ref_());
        assert_eq!(buf.size(), 1);
    }

    #[test]
    fn emit_links_operands() {
        let (mut buf, _stack) = test_buffer();
        buf.opts.fold = false;
        let a = buf.slot(0);
        let t = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), a.ref_())
            .unwrap();
        assert_eq!(t.ref_(), REF_FIRST + 1);
        assert_eq!(buf.ir(t.ref_()).opcode(), Opcode::Add);
        assert_eq!(buf.ir(t.ref_()).op1(), a.ref_());
        assert_eq!(buf.size(), 2);
    }

    #[test]
    fn literals_are_interned() {
        let (mut buf, _stack) = test_buffer();
        let a = buf.literal(IrType::I64, 1234);
        let b = buf.literal(IrType::I64, 1234);
        assert_eq!(a, b);
        assert_eq!(a.ref_(), REF_BIAS - 1);
        assert!(a.is_literal());
        assert_eq!(buf.size(), 1);
    }

    #[test]
    fn literal_identity_includes_type() {
        let (mut buf, _stack) = test_buffer();
        let a = buf.literal(IrType::I64, 1234);
        let b = buf.literal(IrType::I32, 1234);
        assert_ne!(a.ref_(), b.ref_());
        assert_eq!(a.ty(), IrType::I64);
        assert_eq!(b.ty(), IrType::I32);
    }

    #[test]
    fn wide_literals_use_the_word_pool() {
        let (mut buf, _stack) = test_buffer();
        let a = buf.literal(IrType::I64, 5_000_000_000);
        let b = buf.literal(IrType::I64, 5_000_000_000);
        let c = buf.literal(IrType::I64, 5_000_000_001);
        assert_eq!(a, b);
        assert_ne!(a.ref_(), c.ref_());
        assert_eq!(buf.ir(a.ref_()).opcode(), Opcode::Kword);
        assert_eq!(buf.literal_value(a.ref_(), 0), 5_000_000_000);
    }

    #[test]
    fn wide_literal_identity_includes_type() {
        let (mut buf, _stack) = test_buffer();
        let a = buf.literal(IrType::I64, 5_000_000_000);
        let b = buf.literal(IrType::Pc, 5_000_000_000);
        assert_ne!(a.ref_(), b.ref_());
    }

    #[test]
    fn negative_literals_sign_extend() {
        let (mut buf, _stack) = test_buffer();
        let a = buf.literal(IrType::I64, -1234i64 as Word);
        assert_eq!(buf.ir(a.ref_()).opcode(), Opcode::Kint);
        assert_eq!(buf.literal_value(a.ref_(), 0), -1234i64 as Word);
    }

    #[test]
    fn base_literals() {
        let (mut buf, stack) = test_buffer();
        let a = buf.base_literal(&stack[15] as *const Word as Word);
        let b = buf.base_literal(&stack[3] as *const Word as Word);
        let c = buf.base_literal(&stack[15] as *const Word as Word);
        assert_eq!(a, c);
        assert_ne!(a.ref_(), b.ref_());
        assert_eq!(buf.ir(a.ref_()).i32v(), 4);
        assert_eq!(buf.ir(b.ref_()).i32v(), -8);
        let base = buf.slots.start_base();
        assert_eq!(buf.literal_value(a.ref_(), base), &stack[15] as *const Word as Word);
    }

    #[test]
    fn chain_reaches_every_instruction_once() {
        // For every instruction with opcode `op`, walking `chain[op]`
        // reaches it exactly once.
        let (mut buf, _stack) = test_buffer();
        buf.opts.fold = false;
        let a = buf.slot(0);
        let b = buf.slot(1);
        let t1 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), b.ref_())
            .unwrap();
        let t2 = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), t1.ref_(), b.ref_())
            .unwrap();
        let mut seen = Vec::new();
        let mut r = buf.chain_head(Opcode::Add);
        while r != 0 {
            seen.push(r);
            r = buf.ir(r).prev();
        }
        assert_eq!(seen, vec![t2.ref_(), t1.ref_()]);
        let mut sloads = Vec::new();
        let mut r = buf.chain_head(Opcode::Sload);
        while r != 0 {
            sloads.push(r);
            r = buf.ir(r).prev();
        }
        assert_eq!(sloads, vec![b.ref_(), a.ref_()]);
    }

    #[test]
    fn heap_checks_fuse_until_a_guard() {
        let (mut buf, _stack) = test_buffer();
        buf.emit_heap_check(3).unwrap();
        buf.emit_heap_check(2).unwrap();
        let mut checks = Vec::new();
        let mut r = buf.chain_head(Opcode::HeapChk);
        while r != 0 {
            checks.push(buf.ir(r).op1());
            r = buf.ir(r).prev();
        }
        assert_eq!(checks, vec![5]);
        // A guard separates heap regions.
        let a = buf.slot(0);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(Opcode::Lt, TyBits::guarded(IrType::Void), a.ref_(), zero.ref_());
        buf.emit_heap_check(4).unwrap();
        let mut checks = Vec::new();
        let mut r = buf.chain_head(Opcode::HeapChk);
        while r != 0 {
            checks.push(buf.ir(r).op1());
            r = buf.ir(r).prev();
        }
        assert_eq!(checks, vec![4, 5]);
    }

    #[test]
    fn display_renders_the_buffer() {
        let (mut buf, _stack) = test_buffer();
        let a = buf.slot(0);
        let k = buf.literal(IrType::I64, 7);
        let t = buf
            .emit(Opcode::Add, TyBits::plain(IrType::I64), a.ref_(), k.ref_())
            .unwrap();
        buf.set_slot(0, t);
        let zero = buf.literal(IrType::I64, 0);
        buf.emit_raw(Opcode::Lt, TyBits::guarded(IrType::Void), t.ref_(), zero.ref_());
        let text = buf.debug_string();
        fm::FMatcher::new(
            "k001 kint...
k000 kint...
%001  sload...
%002  add...
%003 >lt...
",
        )
        .unwrap()
        .matches(&text)
        .unwrap();
    }

    #[test]
    fn frame_overflow_aborts() {
        let (mut buf, stack) = test_buffer();
        let base = &stack[11] as *const Word as Word;
        let res = buf.frame(base, base + (MAX_SLOTS + 1) * WORD_SIZE);
        assert!(matches!(res, Err(TraceError::AbstractStackOverflow)));
    }

    #[test]
    fn base_below_slot_floor_aborts() {
        let (mut buf, stack) = test_buffer();
        let base = &stack[11] as *const Word as Word;
        // Returning below the entry frame is fine while headroom remains.
        buf.frame(base - 4 * WORD_SIZE, base).unwrap();
        buf.frame(base, base + 4 * WORD_SIZE).unwrap();
        // Pushing the minimum below the array floor must abort, not crash.
        let res = buf.frame(base - 300 * WORD_SIZE, base);
        assert!(matches!(res, Err(TraceError::AbstractStackOverflow)));
    }
}
