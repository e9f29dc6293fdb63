//! Virtual unwinding of stub and native frames.
//!
//! Stubs and barriers are frameless: their caller's return address is still
//! in `lr`. Native code keeps a frame record at `fp`: the caller's `fp` at
//! `[fp]` and the return address at `[fp + 8]`, with its saved callee-saved
//! registers in the words just below the record.
use crate::{
    arch::regs::{CALLEE_SAVED, FP, LR, SP},
    code_heap::{CodeHeap, CodeKind},
    error::UnwindError,
    machine::Context,
    memory::{Address, WORD_SIZE},
    sync::Arc,
};
use serde::Serialize;
use tracing::{error, trace};

/// Frames walked before the chain is declared corrupt.
const MAX_FRAMES: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnwindMode {
    /// Failure to find a caller is fatal.
    Live,
    /// Failures are returned to the caller.
    Diagnostic,
}

/// The machine state of one frame as far as unwinding cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegDisplay {
    pub pc: Address,
    pub sp: Address,
    pub fp: Address,
    pub lr: Address,
    pub callee_saved: [u64; CALLEE_SAVED.len()],
}

impl RegDisplay {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            pc: ctx.pc,
            sp: Address(ctx.reg(SP)),
            fp: Address(ctx.reg(FP)),
            lr: Address(ctx.reg(LR)),
            callee_saved: CALLEE_SAVED.map(|reg| ctx.reg(reg)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindStep {
    /// The display now describes the caller.
    Caller,
    /// The outermost frame.
    NoCaller,
    /// `pc` is already in managed code; managed unwinding takes over.
    FirstFrameManaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub pc: Address,
    pub sp: Address,
    pub kind: Option<CodeKind>,
}

pub struct Unwinder {
    heap: Arc<CodeHeap>,
    mode: UnwindMode,
}

impl Unwinder {
    pub fn new(heap: Arc<CodeHeap>, mode: UnwindMode) -> Self {
        Self { heap, mode }
    }

    pub fn mode(&self) -> UnwindMode {
        self.mode
    }

    /// Replace `regs` with its caller's state.
    ///
    /// In [`UnwindMode::Live`] a failure aborts the process.
    pub fn step(&self, regs: &mut RegDisplay) -> Result<UnwindStep, UnwindError> {
        match self.try_step(regs) {
            Err(err) if self.mode == UnwindMode::Live => {
                error!(%err, pc = %regs.pc, sp = %regs.sp, "unable to unwind native frame");
                std::process::abort();
            }
            result => result,
        }
    }

    fn try_step(&self, regs: &mut RegDisplay) -> Result<UnwindStep, UnwindError> {
        if regs.pc.is_null() {
            return Ok(UnwindStep::NoCaller);
        }
        let range = self
            .heap
            .code_map()
            .lookup(regs.pc)
            .ok_or(UnwindError::UnknownCode(regs.pc))?;

        match range.kind {
            CodeKind::Managed(_) => Ok(UnwindStep::FirstFrameManaged),
            CodeKind::Stub | CodeKind::Barrier => {
                if regs.lr.is_null() || regs.lr == regs.pc {
                    return Err(UnwindError::UnknownCode(regs.pc));
                }
                trace!(pc = %regs.pc, caller = %regs.lr, "unwound frameless stub");
                regs.pc = regs.lr;
                Ok(UnwindStep::Caller)
            }
            CodeKind::Native { saved_registers } => self.step_native(regs, saved_registers),
        }
    }

    fn step_native(
        &self,
        regs: &mut RegDisplay,
        saved_registers: u8,
    ) -> Result<UnwindStep, UnwindError> {
        let fp = regs.fp;
        if fp.is_null() {
            return Ok(UnwindStep::NoCaller);
        }
        let memory = self.heap.memory();
        let caller_fp = Address(memory.load_word(fp)?);
        let return_pc = Address(memory.load_word(fp + WORD_SIZE)?);
        // The stack grows down, so callers' records sit higher.
        if !caller_fp.is_null() && caller_fp <= fp {
            return Err(UnwindError::CorruptFrame(fp));
        }

        let saved = (saved_registers as usize).min(CALLEE_SAVED.len());
        for i in 0..saved {
            regs.callee_saved[i] = memory.load_word(fp.offset(-((i as i64 + 1) * 8)))?;
        }
        regs.sp = fp + 2 * WORD_SIZE;
        regs.fp = caller_fp;
        regs.lr = return_pc;
        regs.pc = return_pc;
        trace!(%fp, caller = %return_pc, saved, "unwound native frame");
        Ok(if return_pc.is_null() {
            UnwindStep::NoCaller
        } else {
            UnwindStep::Caller
        })
    }

    /// Collect every frame from `regs` outwards, ending with the first
    /// managed frame if there is one.
    pub fn walk(&self, mut regs: RegDisplay) -> Result<Vec<Frame>, UnwindError> {
        let mut frames = Vec::new();
        loop {
            let kind = self.heap.code_map().lookup(regs.pc).map(|r| r.kind);
            frames.push(Frame {
                pc: regs.pc,
                sp: regs.sp,
                kind,
            });
            if frames.len() > MAX_FRAMES {
                return Err(UnwindError::CorruptFrame(regs.fp));
            }
            match self.step(&mut regs)? {
                UnwindStep::Caller => continue,
                UnwindStep::NoCaller | UnwindStep::FirstFrameManaged => return Ok(frames),
            }
        }
    }
}
