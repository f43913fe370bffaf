//! Info tables and closures.
//!
//! Every heap object is a sequence of words whose first word points at an
//! [InfoTable] describing its kind, layout and (for functions and thunks)
//! its code. The original runtime models info tables as a class hierarchy;
//! here a single struct with an [InfoKind] discriminant and a common prefix
//! suffices — the kind is inspected at only a handful of call sites.

use super::{
    bytecode::{BcIns, BcOp, Code},
    Word, WORD_SIZE,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::OnceLock};

/// The kind of heap object an info table describes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoKind {
    /// A fully evaluated constructor application.
    Constr,
    /// A function closure.
    Fun,
    /// An unevaluated suspension.
    Thunk,
    /// A top-level (constant applicative form) thunk.
    Caf,
    /// A partial application.
    Pap,
    /// An indirection to another closure (left behind by updates).
    Ind,
}

/// A per-object-kind descriptor: layout, constructor tag and entry code.
#[derive(Debug)]
pub struct InfoTable {
    pub kind: InfoKind,
    /// Constructor tag, 1-based (constructors only).
    pub tag: u16,
    /// Payload size in words.
    pub size: u16,
    /// Entry code, for `Fun`/`Thunk`/`Caf` info tables.
    pub code: Option<Code>,
    /// Symbolic name, for trace debugging output.
    pub name: &'static str,
}

impl InfoTable {
    pub fn data(kind: InfoKind, tag: u16, size: u16, name: &'static str) -> Self {
        InfoTable {
            kind,
            tag,
            size,
            code: None,
            name,
        }
    }

    pub fn entry(kind: InfoKind, code: Code, name: &'static str) -> Self {
        InfoTable {
            kind,
            tag: 0,
            size: code.framesize as u16,
            code: Some(code),
            name,
        }
    }

    /// The code block of a `Fun`/`Thunk`/`Caf` info table.
    ///
    /// # Panics
    ///
    /// Panics if the info table carries no code; callers must have checked
    /// the kind first.
    pub fn code(&self) -> &Code {
        self.code.as_ref().expect("info table has no code")
    }

    pub fn as_word(&'static self) -> Word {
        self as *const InfoTable as Word
    }
}

/// A raw reference to a closure: a pointer to its header word.
///
/// Closures are not owned by the JIT; the recorder merely inspects live
/// objects the interpreter hands it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosureRef(pub *mut Word);

impl ClosureRef {
    pub fn from_word(w: Word) -> Self {
        ClosureRef(w as *mut Word)
    }

    pub fn as_word(self) -> Word {
        self.0 as Word
    }

    /// The object's info table.
    ///
    /// # Safety
    ///
    /// The reference must point at a live closure.
    pub unsafe fn info(self) -> &'static InfoTable {
        &*(*self.0 as *const InfoTable)
    }

    /// Payload word `i` (word `i + 1` of the object).
    pub unsafe fn payload(self, i: usize) -> Word {
        *self.0.add(1 + i)
    }

    pub unsafe fn is_indirection(self) -> bool {
        self.info().kind == InfoKind::Ind
    }

    /// Is the closure in head normal form (a constructor, a function or a
    /// partial application)?
    pub unsafe fn is_hnf(self) -> bool {
        matches!(
            self.info().kind,
            InfoKind::Constr | InfoKind::Fun | InfoKind::Pap
        )
    }
}

/// Word offsets into a PAP object. The payload holds the already-supplied
/// arguments.
pub const PAP_INFO_WORD: usize = 1;
pub const PAP_FUNCTION_WORD: usize = 2;
pub const PAP_PAYLOAD_WORD: usize = 3;

/// The header size of a PAP in words (info pointer, packed argument info,
/// function pointer).
pub const PAP_HEADER_WORDS: usize = PAP_PAYLOAD_WORD;

/// Pack a PAP's argument count and pointer mask into its info word.
pub fn pap_pack(nargs: u32, pointer_mask: u32) -> Word {
    (nargs as Word) | ((pointer_mask as Word) << 16)
}

pub fn pap_nargs(packed: Word) -> u32 {
    (packed & 0xffff) as u32
}

pub fn pap_pointer_mask(packed: Word) -> u32 {
    (packed >> 16) as u32
}

/// A PAP viewed through its closure reference.
#[derive(Clone, Copy)]
pub struct PapRef(pub ClosureRef);

impl PapRef {
    pub unsafe fn packed_info(self) -> Word {
        *self.0 .0.add(PAP_INFO_WORD)
    }

    pub unsafe fn nargs(self) -> u32 {
        pap_nargs(self.packed_info())
    }

    pub unsafe fn fun(self) -> ClosureRef {
        ClosureRef::from_word(*self.0 .0.add(PAP_FUNCTION_WORD))
    }
}

/// The frame size of an AP continuation holding `nargs` arguments: the
/// arguments plus the closure being applied.
pub fn ap_cont_framesize(nargs: u32) -> u32 {
    nargs + 1
}

/// An AP continuation: the return point that applies saved arguments once
/// the evaluated function value is returned to it.
#[derive(Clone, Copy, Debug)]
pub struct ApCont {
    /// Address of the continuation's closure.
    pub closure: Word,
    /// Address of the continuation's return point.
    pub return_pc: *const BcIns,
}

/// Process-wide closures the recorder specialises against: the update-frame
/// closure and return point, the shared PAP and indirection info tables, and
/// the AP continuations, created on demand per `(nargs, pointer mask)`.
pub struct MiscClosures {
    upd_info: &'static InfoTable,
    upd_closure: Word,
    upd_return_pc: *const BcIns,
    pap_info: &'static InfoTable,
    ind_info: &'static InfoTable,
    ap_conts: Mutex<HashMap<(u32, u32), ApCont>>,
    ap_infos: Mutex<HashMap<(u32, u32), &'static InfoTable>>,
}

// The raw pointers inside all refer to leaked, immutable allocations.
unsafe impl Send for MiscClosures {}
unsafe impl Sync for MiscClosures {}

/// The size of an update frame in slots.
pub const UPDATE_FRAME_SIZE: u32 = 2;

impl MiscClosures {
    fn new() -> Self {
        // The update code block: restore the updatee from slot 0, update it
        // with the result, and pass the result on. Only its address and
        // shape matter to the recorder; the interpreter owns its execution.
        let mut upd_code = Code::new(0, UPDATE_FRAME_SIZE as u8);
        upd_code.ins = vec![
            BcIns::ad(BcOp::Ifunc, UPDATE_FRAME_SIZE as u8, 0),
            BcIns::ad(BcOp::MovRes, 1, 0),
            BcIns::ad(BcOp::Update, 0, 1),
            BcIns::ad(BcOp::Ret1, 1, 0),
        ];
        let upd_info: &'static InfoTable = Box::leak(Box::new(InfoTable::entry(
            InfoKind::Fun,
            upd_code,
            "stg_UPD",
        )));
        // The update return point is the instruction after the header.
        let upd_return_pc = &upd_info.code().ins[1] as *const BcIns;
        let upd_closure = Box::leak(Box::new([upd_info.as_word()])).as_ptr() as Word;
        let pap_info: &'static InfoTable =
            Box::leak(Box::new(InfoTable::data(InfoKind::Pap, 0, 0, "stg_PAP")));
        let ind_info: &'static InfoTable =
            Box::leak(Box::new(InfoTable::data(InfoKind::Ind, 0, 1, "stg_IND")));
        MiscClosures {
            upd_info,
            upd_closure,
            upd_return_pc,
            pap_info,
            ind_info,
            ap_conts: Mutex::new(HashMap::new()),
            ap_infos: Mutex::new(HashMap::new()),
        }
    }

    pub fn update_closure(&self) -> Word {
        self.upd_closure
    }

    pub fn update_return_pc(&self) -> *const BcIns {
        self.upd_return_pc
    }

    pub fn update_info(&self) -> &'static InfoTable {
        self.upd_info
    }

    pub fn pap_info(&self) -> &'static InfoTable {
        self.pap_info
    }

    pub fn indirection_info(&self) -> &'static InfoTable {
        self.ind_info
    }

    /// The info table of an application thunk holding a function plus
    /// `nargs` arguments (the `ALLOCAP` object shape).
    pub fn ap_info(&self, nargs: u32, pointer_mask: u32) -> &'static InfoTable {
        let mut infos = self.ap_infos.lock();
        *infos.entry((nargs, pointer_mask)).or_insert_with(|| {
            Box::leak(Box::new(InfoTable::data(
                InfoKind::Thunk,
                0,
                (nargs + 1) as u16,
                "stg_AP",
            )))
        })
    }

    /// The AP continuation applying `nargs` saved arguments with the given
    /// pointer mask.
    pub fn ap_cont(&self, nargs: u32, pointer_mask: u32) -> ApCont {
        let mut conts = self.ap_conts.lock();
        *conts.entry((nargs, pointer_mask)).or_insert_with(|| {
            let framesize = ap_cont_framesize(nargs) as u8;
            let mut code = Code::new(0, framesize);
            code.ins = vec![
                BcIns::ad(BcOp::Ifunc, framesize, 0),
                BcIns::ad(BcOp::MovRes, framesize - 1, 0),
                BcIns::abc(BcOp::Callt, framesize - 1, 0, nargs as u8),
                BcIns::raw(pointer_mask),
            ];
            let info: &'static InfoTable =
                Box::leak(Box::new(InfoTable::entry(InfoKind::Fun, code, "stg_APK")));
            let return_pc = &info.code().ins[1] as *const BcIns;
            let closure = Box::leak(Box::new([info.as_word()])).as_ptr() as Word;
            ApCont { closure, return_pc }
        })
    }
}

/// The process-wide [MiscClosures] registry.
pub fn misc_closures() -> &'static MiscClosures {
    static MISC: OnceLock<MiscClosures> = OnceLock::new();
    MISC.get_or_init(MiscClosures::new)
}

/// Allocate a static closure for testing: `[info, payload...]`.
///
/// The allocation is leaked so the address stays valid for the process
/// lifetime, mirroring loader-allocated static closures.
pub fn alloc_static_closure(info: &'static InfoTable, payload: &[Word]) -> ClosureRef {
    let mut words = Vec::with_capacity(1 + payload.len());
    words.push(info.as_word());
    words.extend_from_slice(payload);
    ClosureRef(Box::leak(words.into_boxed_slice()).as_mut_ptr())
}

/// Allocate a static PAP for testing.
pub fn alloc_static_pap(fun: ClosureRef, args: &[Word], pointer_mask: u32) -> ClosureRef {
    let packed = pap_pack(args.len() as u32, pointer_mask);
    let mut payload = vec![packed, fun.as_word()];
    payload.extend_from_slice(args);
    alloc_static_closure(misc_closures().pap_info(), &payload)
}

/// Bytes-to-words helper for heap object sizes.
pub fn words_of(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE)
}
