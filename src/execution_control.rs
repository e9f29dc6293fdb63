//! Breakpoint patching for each way managed code can be executed.
//!
//! Jitted and precompiled code are patched in place with the ISA's
//! breakpoint unit; interpreted methods are patched at the bytecode level.
//! [`ExecutionControlRegistry`] picks the right control from the address.
use crate::{
    arch::{regs, InstructionSet, Isa, Reg, UNIT_SIZE},
    code_heap::{CodeHeap, CodeKind},
    error::PatchError,
    machine::Context,
    memory::Address,
    sync::Arc,
};
use dashmap::DashMap;
use enum_dispatch::enum_dispatch;
use serde::Serialize;
use std::ops::Range;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Strategy {
    Jit,
    Interpreter,
    Aot,
}

/// Bytecode that makes the interpreter report a breakpoint.
pub const BREAKPOINT_OPCODE: u8 = 0xfe;

/// The interpreter keeps its bytecode pointer here across calls.
pub const INTERPRETER_IP: Reg = regs::R5;

#[enum_dispatch]
pub trait ExecutionControl {
    fn strategy(&self) -> Strategy;

    /// Whether `address` is code this control is responsible for.
    fn owns(&self, _address: Address) -> bool {
        true
    }

    fn apply_patch(&self, address: Address) -> Result<(), PatchError>;

    fn unapply_patch(&self, address: Address) -> Result<(), PatchError>;

    fn is_patched(&self, address: Address) -> bool;

    /// Whether execution stopped in `ctx` because of the patch at `address`.
    fn matches_current_context(&self, ctx: &Context, address: Address) -> bool {
        self.is_patched(address) && self.extract_fault_address(ctx) == address
    }

    fn extract_fault_address(&self, ctx: &Context) -> Address;
}

/// Swaps single code units through the writable view.
struct CodePatcher {
    heap: Arc<CodeHeap>,
    isa: Isa,
    originals: DashMap<Address, u32>,
}

impl CodePatcher {
    fn new(heap: Arc<CodeHeap>, isa: Isa) -> Self {
        Self {
            heap,
            isa,
            originals: DashMap::new(),
        }
    }

    fn apply(&self, address: Address) -> Result<(), PatchError> {
        let memory = self.heap.memory();
        let mut applied = false;
        self.originals.entry(address).or_try_insert_with(|| {
            let original = memory.load_u32(address)?;
            memory.store_u32(memory.writable_alias(address), self.isa.breakpoint_unit())?;
            applied = true;
            Ok::<_, PatchError>(original)
        })?;
        if !applied {
            return Err(PatchError::AlreadyApplied(address));
        }
        self.heap.flush_instruction_cache(address..address + UNIT_SIZE);
        Ok(())
    }

    fn unapply(&self, address: Address) -> Result<(), PatchError> {
        let (_, original) = self
            .originals
            .remove(&address)
            .ok_or(PatchError::NotApplied(address))?;
        let memory = self.heap.memory();
        memory.store_u32(memory.writable_alias(address), original)?;
        self.heap.flush_instruction_cache(address..address + UNIT_SIZE);
        Ok(())
    }

    fn is_patched(&self, address: Address) -> bool {
        self.originals.contains_key(&address)
    }
}

pub struct JitExecutionControl {
    patcher: CodePatcher,
}

impl JitExecutionControl {
    pub fn new(heap: Arc<CodeHeap>, isa: Isa) -> Self {
        Self {
            patcher: CodePatcher::new(heap, isa),
        }
    }
}

impl ExecutionControl for JitExecutionControl {
    fn strategy(&self) -> Strategy {
        Strategy::Jit
    }

    fn apply_patch(&self, address: Address) -> Result<(), PatchError> {
        self.patcher.apply(address)?;
        debug!(%address, "applied jit breakpoint");
        Ok(())
    }

    fn unapply_patch(&self, address: Address) -> Result<(), PatchError> {
        self.patcher.unapply(address)
    }

    fn is_patched(&self, address: Address) -> bool {
        self.patcher.is_patched(address)
    }

    fn extract_fault_address(&self, ctx: &Context) -> Address {
        ctx.pc
    }
}

/// Precompiled code; only addresses inside the image can be patched.
pub struct AotExecutionControl {
    image: Range<Address>,
    patcher: CodePatcher,
}

impl AotExecutionControl {
    pub fn new(heap: Arc<CodeHeap>, isa: Isa, image: Range<Address>) -> Self {
        Self {
            image,
            patcher: CodePatcher::new(heap, isa),
        }
    }

    fn check(&self, address: Address) -> Result<(), PatchError> {
        if self.image.contains(&address) {
            Ok(())
        } else {
            Err(PatchError::NotInImage(address))
        }
    }
}

impl ExecutionControl for AotExecutionControl {
    fn strategy(&self) -> Strategy {
        Strategy::Aot
    }

    fn owns(&self, address: Address) -> bool {
        self.image.contains(&address)
    }

    fn apply_patch(&self, address: Address) -> Result<(), PatchError> {
        self.check(address)?;
        self.patcher.apply(address)?;
        debug!(%address, "applied precompiled-code breakpoint");
        Ok(())
    }

    fn unapply_patch(&self, address: Address) -> Result<(), PatchError> {
        self.check(address)?;
        self.patcher.unapply(address)
    }

    fn is_patched(&self, address: Address) -> bool {
        self.patcher.is_patched(address)
    }

    fn extract_fault_address(&self, ctx: &Context) -> Address {
        ctx.pc
    }
}

pub struct InterpreterExecutionControl {
    heap: Arc<CodeHeap>,
    originals: DashMap<Address, u8>,
}

impl InterpreterExecutionControl {
    pub fn new(heap: Arc<CodeHeap>) -> Self {
        Self {
            heap,
            originals: DashMap::new(),
        }
    }

    /// The opcode the interpreter should execute at `address` once it has
    /// reported the breakpoint.
    pub fn original_opcode(&self, address: Address) -> Option<u8> {
        self.originals.get(&address).map(|o| *o)
    }
}

impl ExecutionControl for InterpreterExecutionControl {
    fn strategy(&self) -> Strategy {
        Strategy::Interpreter
    }

    fn apply_patch(&self, address: Address) -> Result<(), PatchError> {
        let memory = self.heap.memory();
        let mut applied = false;
        self.originals.entry(address).or_try_insert_with(|| {
            let original = memory.load_u8(address)?;
            memory.store_u8(address, BREAKPOINT_OPCODE)?;
            applied = true;
            Ok::<_, PatchError>(original)
        })?;
        if !applied {
            return Err(PatchError::AlreadyApplied(address));
        }
        debug!(%address, "applied bytecode breakpoint");
        Ok(())
    }

    fn unapply_patch(&self, address: Address) -> Result<(), PatchError> {
        let (_, original) = self
            .originals
            .remove(&address)
            .ok_or(PatchError::NotApplied(address))?;
        self.heap.memory().store_u8(address, original)?;
        Ok(())
    }

    fn is_patched(&self, address: Address) -> bool {
        self.originals.contains_key(&address)
    }

    fn extract_fault_address(&self, ctx: &Context) -> Address {
        Address(ctx.reg(INTERPRETER_IP))
    }
}

#[enum_dispatch(ExecutionControl)]
pub enum ExecutionStrategy {
    Jit(JitExecutionControl),
    Interpreter(InterpreterExecutionControl),
    Aot(AotExecutionControl),
}

/// Routes patch requests to the strategy that produced the code.
pub struct ExecutionControlRegistry {
    heap: Arc<CodeHeap>,
    controls: Vec<ExecutionStrategy>,
}

impl ExecutionControlRegistry {
    pub fn new(heap: Arc<CodeHeap>) -> Self {
        Self {
            heap,
            controls: Vec::new(),
        }
    }

    pub fn register(&mut self, control: impl Into<ExecutionStrategy>) {
        self.controls.push(control.into());
    }

    /// Interpreted bytecode lives in the data heap; everything else is
    /// found through the code map.
    pub fn strategy_for(&self, address: Address) -> Option<Strategy> {
        match self.heap.code_map().lookup(address).map(|r| r.kind) {
            Some(CodeKind::Managed(strategy)) => Some(strategy),
            Some(_) => None,
            None => self
                .heap
                .memory()
                .data_range()
                .contains(&address)
                .then_some(Strategy::Interpreter),
        }
    }

    pub fn control_for(&self, address: Address) -> Result<&ExecutionStrategy, PatchError> {
        let strategy = self
            .strategy_for(address)
            .ok_or(PatchError::NoStrategy(address))?;
        self.controls
            .iter()
            .find(|c| c.strategy() == strategy && c.owns(address))
            .ok_or(PatchError::NoStrategy(address))
    }

    pub fn apply_patch(&self, address: Address) -> Result<(), PatchError> {
        self.control_for(address)?.apply_patch(address)
    }

    pub fn unapply_patch(&self, address: Address) -> Result<(), PatchError> {
        self.control_for(address)?.unapply_patch(address)
    }

    pub fn is_patched(&self, address: Address) -> bool {
        self.control_for(address)
            .map(|c| c.is_patched(address))
            .unwrap_or(false)
    }
}
