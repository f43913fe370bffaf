//! The trace JIT.
//!
//! A [Jit] owns everything the four-stage pipeline needs: the IR buffer the
//! recorder emits into, the call-stack shadow and branch-target buffer, the
//! fragment store, configuration and abort statistics. The interpreter talks
//! to it through a narrow contract: [Jit::on_hot_pc], [Jit::record_ins],
//! [Jit::lookup_fragment], [Jit::enter_fragment].

pub mod callstack;
pub mod codegen;
pub mod fragment;
pub mod ir;
pub mod opt;
pub mod recorder;

use crate::{
    print_jit_state,
    vm::{
        bytecode::{BcIns, BcOp},
        thread::{Capability, Thread},
        Word,
    },
};
use callstack::{BranchTargetBuffer, CallStack};
use codegen::x86_64::ExitState;
use fragment::{Fragment, FragmentStore, TraceId};
use ir::{snapshot::SnapNo, IrBuffer};
use strum::EnumCount;
use thiserror::Error;

/// Why a recording was abandoned. Aborts are normal operation: the buffer is
/// discarded and the interpreter continues as if nothing happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, EnumCount)]
pub enum TraceError {
    #[error("abstract stack overflow")]
    AbstractStackOverflow,
    #[error("guard known to fail")]
    KnownFailingGuard,
    #[error("trace too long")]
    TraceTooLong,
    #[error("abort requested by interpreter")]
    InterpreterRequest,
    #[error("not yet implemented: {0}")]
    Nyi(&'static str),
}

impl TraceError {
    fn counter_index(self) -> usize {
        match self {
            TraceError::AbstractStackOverflow => 0,
            TraceError::KnownFailingGuard => 1,
            TraceError::TraceTooLong => 2,
            TraceError::InterpreterRequest => 3,
            TraceError::Nyi(_) => 4,
        }
    }
}

/// A failure while turning a finished recording into a fragment. Unlike
/// [TraceError] these indicate resource exhaustion or a codegen bug.
#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Boolean optimisation and feature toggles.
#[derive(Clone, Copy, Debug)]
pub struct JitOpts {
    pub enable_asm: bool,
    pub enable_side_traces: bool,
    pub opt_dce: bool,
    pub opt_unroll: bool,
    pub opt_sink_alloc: bool,
    pub opt_cse: bool,
    pub opt_call_by_name: bool,
    pub opt_debug_trace: bool,
}

impl Default for JitOpts {
    fn default() -> Self {
        JitOpts {
            enable_asm: true,
            enable_side_traces: true,
            opt_dce: true,
            opt_unroll: true,
            opt_sink_alloc: true,
            opt_cse: true,
            opt_call_by_name: false,
            opt_debug_trace: false,
        }
    }
}

/// Integer tuning parameters.
#[derive(Clone, Copy, Debug)]
pub struct JitParams {
    /// Size of one machine-code arena in bytes.
    pub mcode_arena_size: usize,
    /// Ceiling on total machine code in bytes; exceeding it is fatal for
    /// new compilations.
    pub mcode_max: usize,
    /// Hot-counter threshold.
    pub hot_threshold: u16,
    /// Maximum number of recorded branch targets before a trace is
    /// considered too long.
    pub max_trace: usize,
    /// Guard-exit counter threshold before a side trace is requested.
    pub exit_threshold: u8,
}

impl Default for JitParams {
    fn default() -> Self {
        JitParams {
            mcode_arena_size: 4 << 20,
            mcode_max: 64 << 20,
            hot_threshold: crate::hotcount::DEFAULT_HOT_THRESHOLD,
            max_trace: 100,
            exit_threshold: 7,
        }
    }
}

/// What kind of trace is being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceType {
    Root,
    Fallthrough,
    Side,
}

/// The capability's JIT mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JitMode {
    Normal,
    Recording,
}

/// Result of shadowing one interpreter step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    /// Keep interpreting and recording.
    Continue,
    /// The trace was completed and compiled; recording is over.
    Finished,
    /// Recording was abandoned; the interpreter continues normally.
    Aborted,
}

/// What the interpreter should do after a trace exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Resume interpretation at the thread's restored PC.
    Interpret,
    /// State was restored and a new recording has begun; interpret in
    /// recording mode.
    BeginRecording,
}

/// A tiny LCG, used where the JIT needs cheap non-adversarial randomness
/// (machine-code placement, stress tests).
pub struct Prng {
    state: u32,
}

impl Prng {
    pub fn new() -> Self {
        Prng { state: 0x72ba83e }
    }

    pub fn seeded(seed: u32) -> Self {
        Prng { state: seed }
    }

    pub fn bits(&mut self, nbits: u32) -> u32 {
        self.state = self.state.wrapping_mul(1103515245).wrapping_add(12345);
        self.state >> (32 - nbits)
    }

    pub fn in_range(&mut self, low: u32, high: u32) -> u32 {
        low + self.bits(16) % (high - low)
    }

    pub fn word(&mut self) -> Word {
        let hi = self.bits(32) as Word;
        let lo = self.bits(32) as Word;
        let w = (hi << 32) | lo;
        if w == 0 {
            0xf00dbee5 << 8
        } else {
            w
        }
    }
}

/// Per-reason abort counters.
#[derive(Default)]
pub struct AbortStats {
    pub total: u64,
    by_reason: [u64; TraceError::COUNT],
}

impl AbortStats {
    pub fn count(&self, e: TraceError) -> u64 {
        self.by_reason[e.counter_index()]
    }

    fn bump(&mut self, e: TraceError) {
        self.total += 1;
        self.by_reason[e.counter_index()] += 1;
    }
}

/// The JIT context. One per capability; fragments are not shared between
/// capabilities.
pub struct Jit {
    pub opts: JitOpts,
    pub params: JitParams,
    pub(crate) buf: IrBuffer,
    pub(crate) callstack: CallStack,
    pub(crate) btb: BranchTargetBuffer,
    pub(crate) fragments: FragmentStore,
    pub aborts: AbortStats,

    mode: JitMode,
    pub(crate) start_pc: Word,
    pub(crate) is_return_trace: bool,
    pub(crate) trace_type: TraceType,
    pub(crate) parent: Option<(TraceId, SnapNo)>,
    pub(crate) last_was_branch: bool,
    should_abort: bool,
    /// Total bytes of machine code emitted so far.
    total_mcode: usize,
}

impl Jit {
    pub fn new(params: JitParams, opts: JitOpts) -> Self {
        Jit {
            opts,
            params,
            buf: IrBuffer::new(),
            callstack: CallStack::new(),
            btb: BranchTargetBuffer::new(),
            fragments: FragmentStore::new(),
            aborts: AbortStats::default(),
            mode: JitMode::Normal,
            start_pc: 0,
            is_return_trace: false,
            trace_type: TraceType::Root,
            parent: None,
            last_was_branch: false,
            should_abort: false,
            total_mcode: 0,
        }
    }

    pub fn mode(&self) -> JitMode {
        self.mode
    }

    pub fn is_recording(&self) -> bool {
        self.mode == JitMode::Recording
    }

    /// Ask the recorder to abandon the current trace at the next step.
    /// Always safe: no partial fragment is ever registered.
    pub fn request_abort(&mut self) {
        self.should_abort = true;
    }

    pub(crate) fn take_abort_request(&mut self) -> bool {
        std::mem::take(&mut self.should_abort)
    }

    fn init_recording(&mut self, start_pc: *const BcIns, base: *mut Word, top: *mut Word) {
        self.buf.reset(base as Word, top as Word);
        self.callstack.reset();
        self.btb.reset(start_pc as Word, &self.callstack);
        self.start_pc = start_pc as Word;
        self.parent = None;
        self.last_was_branch = false;
        self.should_abort = false;
        self.buf.opts.fold = true;
        self.buf.opts.cse = self.opts.opt_cse;
        self.mode = JitMode::Recording;
    }

    /// Start recording a root trace at `start_pc`.
    pub fn begin_recording(
        &mut self,
        start_pc: *const BcIns,
        base: *mut Word,
        top: *mut Word,
        is_return: bool,
    ) {
        debug_assert!(self.mode == JitMode::Normal);
        print_jit_state("start-recording");
        self.init_recording(start_pc, base, top);
        self.is_return_trace = is_return;
        self.trace_type = TraceType::Root;
    }

    /// Start recording a side trace from a guard exit of `parent`. The
    /// interpreter state has already been restored from the snapshot, so
    /// the trace reads its inputs from the stack like a root trace.
    pub fn begin_side_trace(
        &mut self,
        parent: TraceId,
        exit: SnapNo,
        start_pc: *const BcIns,
        base: *mut Word,
        top: *mut Word,
    ) {
        debug_assert!(self.mode == JitMode::Normal);
        print_jit_state("start-side-tracing");
        self.init_recording(start_pc, base, top);
        self.is_return_trace = false;
        self.trace_type = TraceType::Side;
        self.parent = Some((parent, exit));
    }

    /// Mark the in-progress root recording as the fall-through continuation
    /// of `parent`'s exit: once compiled, that exit jumps straight here.
    pub fn set_fallthrough_parent(&mut self, parent: TraceId, exit: SnapNo) {
        self.trace_type = TraceType::Fallthrough;
        self.parent = Some((parent, exit));
    }

    /// Called by the interpreter when a hot counter trips.
    pub fn on_hot_pc(
        &mut self,
        pc: *const BcIns,
        thread: &mut Thread,
        is_return: bool,
    ) -> JitMode {
        if self.mode == JitMode::Recording {
            return self.mode;
        }
        let base = thread.base_ptr();
        let top = thread.top_ptr();
        self.begin_recording(pc, base, top, is_return);
        self.mode
    }

    /// The fragment whose root starts at `pc`, if any.
    pub fn lookup_fragment(&self, pc: *const BcIns) -> Option<TraceId> {
        self.fragments.lookup(pc as Word)
    }

    pub fn fragment(&self, id: TraceId) -> &Fragment {
        &self.fragments[id]
    }

    pub(crate) fn reset_recorder_state(&mut self) {
        self.mode = JitMode::Normal;
        self.should_abort = false;
        self.last_was_branch = false;
    }

    pub(crate) fn abort_recording(&mut self, e: TraceError) {
        print_jit_state("abort-recording");
        log::debug!("recording aborted: {}", e);
        self.aborts.bump(e);
        self.reset_recorder_state();
    }

    /// Close the recording: optimise, allocate registers, assemble and
    /// register the fragment. Returns the new trace id.
    pub(crate) fn finish_recording(&mut self) -> Result<TraceId, CompilationError> {
        print_jit_state("stop-recording");

        if self.opts.opt_dce {
            opt::dead_code_elim(&mut self.buf, false);
        }
        if self.opts.opt_sink_alloc {
            self.buf.heap_sccs();
        }
        if self.opts.opt_dce {
            opt::dead_code_elim(&mut self.buf, true);
        }
        self.buf.fix_heap_offsets();
        opt::compact_snapshots(&mut self.buf);

        let code = if self.opts.enable_asm {
            let code = codegen::x86_64::codegen(&mut self.buf)?;
            self.total_mcode += code.size();
            if self.total_mcode > self.params.mcode_max {
                // The design assumes effectively unbounded code growth;
                // hitting the hard ceiling is unrecoverable.
                panic!("machine code limit exceeded");
            }
            Some(code)
        } else {
            None
        };

        let id = self.fragments.next_id();
        let frag = Fragment::from_buffer(
            id,
            &self.buf,
            self.start_pc,
            self.parent,
            self.trace_type,
            self.is_return_trace,
            code,
        );
        let is_side = self.trace_type == TraceType::Side;
        self.fragments.register(frag, is_side);

        if let Some((parent, exit)) = self.parent {
            // Exits transfer by trace id: linking the parent's guard is a
            // table write, not a code patch.
            self.fragments[parent].link_exit(exit, id);
        }

        if !is_side && !self.is_return_trace {
            // Patch the start instruction so the interpreter dispatches
            // into the trace on re-entry.
            unsafe {
                *(self.start_pc as *mut BcIns) = BcIns::ad(BcOp::Jfunc, 0, id.as_u16());
            }
        } else if !is_side {
            unsafe {
                *(self.start_pc as *mut BcIns) = BcIns::ad(BcOp::Jret, 0, id.as_u16());
            }
        }

        log::debug!(
            "registered trace {} at pc {:#x} ({:?})",
            id.as_u16(),
            self.start_pc,
            self.trace_type
        );
        self.reset_recorder_state();
        Ok(id)
    }

    /// Transfer control into a compiled fragment, following trace links
    /// until an exit leads back to the interpreter.
    pub fn enter_fragment(
        &mut self,
        id: TraceId,
        thread: &mut Thread,
        cap: &mut Capability,
        hp: *mut Word,
        hplim: *mut Word,
    ) -> ExitAction {
        cap.trace_exit_hp = hp as Word;
        cap.trace_exit_hplim = hplim as Word;
        let mut cur = id;
        loop {
            let frag = &self.fragments[cur];
            let Some(code) = frag.code() else {
                // Assembly disabled: nothing to run.
                return ExitAction::Interpret;
            };
            print_jit_state("enter-trace");
            let mut es = ExitState::new();
            let exit = unsafe {
                code.enter(
                    &mut es,
                    thread.base_ptr(),
                    cap.trace_exit_hp as *mut Word,
                    cap.trace_exit_hplim as *mut Word,
                )
            };
            print_jit_state("exit-trace");
            let disp = codegen::x86_64::deopt::restore_snapshot(
                frag,
                exit,
                &es,
                thread,
                cap,
                &self.opts,
                &self.params,
            );
            match disp {
                codegen::x86_64::deopt::ExitDisposition::Interpret => {
                    return ExitAction::Interpret;
                }
                codegen::x86_64::deopt::ExitDisposition::Link(next) => {
                    cur = next;
                }
                codegen::x86_64::deopt::ExitDisposition::StartSide { parent, exit } => {
                    let pc = thread.pc();
                    let base = thread.base_ptr();
                    let top = thread.top_ptr();
                    self.begin_side_trace(parent, exit, pc, base, top);
                    return ExitAction::BeginRecording;
                }
                codegen::x86_64::deopt::ExitDisposition::StartFallthrough {
                    parent,
                    exit,
                    is_return,
                } => {
                    let pc = thread.pc();
                    // A trace may already have formed at the fall-through
                    // point; if so, link the exit straight to it.
                    if unsafe { *pc }.opcode() == BcOp::Jfunc {
                        if let Some(target) = self.lookup_fragment(pc) {
                            self.fragments[parent].link_exit(exit, target);
                            cur = target;
                            continue;
                        }
                    }
                    let base = thread.base_ptr();
                    let top = thread.top_ptr();
                    self.begin_recording(pc, base, top, is_return);
                    self.set_fallthrough_parent(parent, exit);
                    return ExitAction::BeginRecording;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer(&mut self) -> &mut IrBuffer {
        &mut self.buf
    }
}
