//! The bytecode instruction encoding.
//!
//! Instructions are fixed 32-bit words with a primary opcode byte and either
//! three 8-bit operands (A, B, C) or one 8-bit and one 16-bit operand (A, D).
//! `CALL` and `ALLOC` carry variable-length tails after the instruction word:
//! a 32-bit pointer-mask word and/or argument slot indices packed as bytes,
//! rounded up to whole instruction words.

use super::Word;
use strum::{EnumCount, FromRepr};

/// A bytecode opcode.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumCount, FromRepr)]
pub enum BcOp {
    /// Function header; A = frame size.
    Func,
    /// Header of generated code (AP continuations and the like); A = frame
    /// size. Loops through an `IFUNC` do not cut traces.
    Ifunc,
    /// Patched-in dispatch to a compiled root trace; D = trace id.
    Jfunc,
    /// Patched-in dispatch to a compiled return trace; D = trace id.
    Jret,
    /// A = dst, D = literal id.
    Loadk,
    /// A = dst, D = src.
    Mov,
    /// A = dst, D = index into the returned results.
    MovRes,
    Addrr,
    Subrr,
    Mulrr,
    Divrr,
    Remrr,
    /// A = dst, D = src.
    Neg,
    Bnot,
    Band,
    Bor,
    Bxor,
    Bshl,
    Bshr,
    /// Comparison-and-branch; A and D are the compared slots. The following
    /// instruction is the branch target (`JMP`).
    Islt,
    Isge,
    Isle,
    Isgt,
    Iseq,
    Isne,
    Isltu,
    Isgeu,
    Isleu,
    Isgtu,
    /// Unconditional branch; J = signed offset.
    Jmp,
    /// A = function slot, C = number of arguments. Tail: pointer-mask word,
    /// then argument slot bytes rounded to words.
    Call,
    /// Tail call; arguments are already in slots `0..C`. Tail: pointer-mask
    /// word.
    Callt,
    /// Return one result; A = result slot.
    Ret1,
    /// Return an unboxed result; A = result slot.
    Iret,
    /// Return N results starting at slot 0; A = result count.
    Retn,
    /// Evaluate the closure in slot A to head normal form. Two words long;
    /// the word after carries the live-out mask.
    Eval,
    /// Overwrite the closure in slot A with an indirection to slot D.
    Update,
    /// A = dst, B = info-table slot, C = the single field's slot.
    Alloc1,
    /// A = dst, B = info-table slot, C = field count. Tail: field slot bytes
    /// rounded to words, then a pointer-mask word.
    Alloc,
    /// Allocate an application closure; A = dst, B = pointer mask, C + 1 =
    /// field count. Tail: field slot bytes rounded to words.
    Allocap,
    /// Case dispatch on the constructor tag of slot A.
    Case,
    /// Sparse case dispatch on slot A.
    CaseS,
    /// A = dst, B = closure slot, C = field index (in words, counting the
    /// header).
    Loadf,
    /// A = dst, D = field index; loads from the current frame's node.
    Loadfv,
    /// A = dst; loads the current frame's node itself.
    Loadslf,
    /// A = dst, D = closure slot; loads the constructor tag.
    Gettag,
    /// A = dst, B = pointer slot, C = offset slot; loads a word from a raw
    /// pointer.
    Ptrofsc,
    Stop,
}

impl BcOp {
    /// Does this opcode head a function (and therefore carry the frame size
    /// in A)?
    pub fn is_func_header(self) -> bool {
        matches!(self, BcOp::Func | BcOp::Ifunc | BcOp::Jfunc)
    }
}

/// A literal's type, as recorded by the bytecode compiler alongside the
/// literal pool.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LitType {
    Int,
    Char,
    Str,
    Word,
    Closure,
    Info,
    Pc,
}

/// A 32-bit bytecode instruction.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BcIns(u32);

impl BcIns {
    /// Construct an instruction in A,B,C format.
    pub fn abc(op: BcOp, a: u8, b: u8, c: u8) -> Self {
        BcIns((op as u32) | ((a as u32) << 8) | ((b as u32) << 16) | ((c as u32) << 24))
    }

    /// Construct an instruction in A,D format.
    pub fn ad(op: BcOp, a: u8, d: u16) -> Self {
        BcIns((op as u32) | ((a as u32) << 8) | ((d as u32) << 16))
    }

    /// Construct a branch instruction; `j` is the signed jump offset.
    pub fn aj(op: BcOp, a: u8, j: i16) -> Self {
        Self::ad(op, a, (j as u16).wrapping_add(Self::JMP_BIAS))
    }

    /// Construct a raw data word (used for pointer-mask tail words).
    pub fn raw(w: u32) -> Self {
        BcIns(w)
    }

    const JMP_BIAS: u16 = 0x8000;

    pub fn opcode(self) -> BcOp {
        // A bad opcode byte means the interpreter handed us garbage; there
        // is no way to continue.
        BcOp::from_repr((self.0 & 0xff) as u8).expect("invalid bytecode opcode")
    }

    pub fn a(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn b(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    pub fn c(self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    pub fn d(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn j(self) -> i16 {
        self.d().wrapping_sub(Self::JMP_BIAS) as i16
    }

    pub fn word(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for BcIns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match BcOp::from_repr((self.0 & 0xff) as u8) {
            Some(op) => write!(f, "{:?} a={} b={} c={}", op, self.a(), self.b(), self.c()),
            None => write!(f, "raw({:#x})", self.0),
        }
    }
}

/// The number of instruction words needed to hold `n` argument bytes.
pub fn bc_round(n: usize) -> usize {
    n.div_ceil(4)
}

/// A compiled code block: the per-function part of a `FUN`/`THUNK` info
/// table.
#[derive(Debug)]
pub struct Code {
    /// Number of arguments the function expects.
    pub arity: u8,
    /// Number of stack slots the function's frame occupies.
    pub framesize: u8,
    /// The literal pool.
    pub lits: Vec<Word>,
    /// One [LitType] per literal.
    pub littypes: Vec<LitType>,
    /// The instruction stream.
    pub ins: Vec<BcIns>,
}

impl Code {
    pub fn new(arity: u8, framesize: u8) -> Self {
        Code {
            arity,
            framesize,
            lits: Vec::new(),
            littypes: Vec::new(),
            ins: Vec::new(),
        }
    }

    /// Add a literal, returning its id.
    pub fn push_lit(&mut self, ty: LitType, val: Word) -> u16 {
        self.lits.push(val);
        self.littypes.push(ty);
        u16::try_from(self.lits.len() - 1).unwrap()
    }
}
