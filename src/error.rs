use crate::memory::Address;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StubError {
    #[error("Stub emission failed: {0}")]
    Emit(#[from] EmitError),

    #[error("Memory fault: {0}")]
    Fault(#[from] Fault),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Write barrier maintenance failed: {0}")]
    Barrier(#[from] BarrierError),

    #[error("Unwind failed: {0}")]
    Unwind(#[from] UnwindError),

    #[error("Breakpoint patch failed: {0}")]
    Patch(#[from] PatchError),
}

/// Failures while turning instructions into machine code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmitError {
    #[error("{what} of {value} cannot be encoded by the {isa} instruction set")]
    UnsupportedEncoding {
        what: &'static str,
        value: i64,
        isa: &'static str,
    },

    #[error("Label {0} was referenced but never bound")]
    UnboundLabel(usize),

    #[error("Label {0} was bound twice")]
    LabelRebound(usize),

    #[error("Code heap exhausted: requested {requested} bytes, {available} available")]
    OutOfCodeSpace { requested: u64, available: u64 },

    #[error("Emitted code of {needed} bytes does not fit a {capacity} byte slot")]
    SlotTooSmall { needed: u64, capacity: u64 },

    #[error(transparent)]
    Fault(#[from] Fault),
}

/// Hardware-level faults raised by the simulated address space or stub executor.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("Null reference while accessing {address}")]
    NullReference { address: Address },

    #[error("Access to unmapped address {address}")]
    Unmapped { address: Address },

    #[error("Misaligned {width}-byte access at {address}")]
    Misaligned { address: Address, width: u8 },

    #[error("{access} access denied at {address}")]
    AccessDenied { address: Address, access: Access },

    #[error("Illegal instruction {unit:#010x} at {address}")]
    IllegalInstruction { address: Address, unit: u32 },

    #[error("Step limit of {limit} instructions exceeded at {address}")]
    StepLimit { address: Address, limit: u64 },

    #[error("Data heap exhausted: requested {requested} bytes")]
    OutOfMemory { requested: u64 },
}

/// A fault raised while executing generated code, with the faulting pc.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{fault} (pc {pc})")]
pub struct Trap {
    pub pc: Address,
    pub fault: Fault,
}

impl From<Trap> for DispatchError {
    fn from(trap: Trap) -> Self {
        DispatchError::Fault {
            pc: trap.pc,
            fault: trap.fault,
        }
    }
}

impl From<Trap> for BarrierError {
    fn from(trap: Trap) -> Self {
        BarrierError::Trap {
            pc: trap.pc,
            fault: trap.fault,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "Read"),
            Access::Write => write!(f, "Write"),
            Access::Execute => write!(f, "Execute"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Fault at {pc} during dispatch: {fault}")]
    Fault { pc: Address, fault: Fault },

    #[error("Type {receiver_type} has no implementation for dispatch token {token}")]
    MissingImplementation { receiver_type: Address, token: u64 },

    #[error("Indirection cell {0} is not a prepared call site")]
    UnknownCallSite(Address),

    #[error("Resolve cache of 2^{bits} buckets is out of range")]
    InvalidCacheSize { bits: u32 },

    #[error("Generated code left through an unexpected exit at {0}")]
    UnexpectedExit(Address),

    #[error(transparent)]
    Memory(#[from] Fault),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BarrierError {
    #[error("No write barrier variant is active for {0:?}")]
    NoActiveVariant(crate::write_barrier::BarrierKind),

    #[error("Write barrier faulted at {pc}: {fault}")]
    Trap { pc: Address, fault: Fault },

    #[error("Write barrier left through an unexpected exit at {0}")]
    UnexpectedExit(Address),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error(transparent)]
    Fault(#[from] Fault),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnwindError {
    #[error("No unwind information for code at {0}")]
    UnknownCode(Address),

    #[error("Frame chain is corrupt at frame pointer {0}")]
    CorruptFrame(Address),

    #[error(transparent)]
    Fault(#[from] Fault),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    #[error("Breakpoint at {0} is already applied")]
    AlreadyApplied(Address),

    #[error("Breakpoint at {0} is not applied")]
    NotApplied(Address),

    #[error("Address {0} is outside the precompiled image")]
    NotInImage(Address),

    #[error("No execution strategy owns code at {0}")]
    NoStrategy(Address),

    #[error(transparent)]
    Fault(#[from] Fault),
}
