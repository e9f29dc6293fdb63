//! Runtime-generated stubs.
//!
//! Virtual calls go through an indirection cell holding the address of one of
//! three stub kinds:
//!
//! - **Lookup**: always tail-calls the resolver. A cell starts here.
//! - **Dispatch**: monomorphic fast path. Compares the receiver's type with one
//!   expected type and jumps to its target, or to the call site's resolve stub
//!   fail entry.
//! - **Resolve**: polymorphic path through the shared [`ResolveCache`], with
//!   separate resolve, slow and fail entry points.
//!
//! Every stub is entered with the receiver in `r0`, arguments in `r1..r3` and
//! the cell address in `r4`. Stubs only use `r9..r12` as scratch and may OR
//! [`flags`] into `r4` to tell the resolver why it was entered. The resolver
//! receives the dispatch token in `r12`.
//!
//! [`ResolveCache`]: crate::resolve_cache::ResolveCache
use crate::{
    arch::{Isa, InstructionSet},
    assembler::Assembler,
    code_heap::{CodeHeap, CodeKind},
    error::EmitError,
    memory::Address,
    metrics::{StubKind, StubMetrics},
    sync::Arc,
    types::DispatchToken,
};
use tracing::debug;

mod dispatch;
mod lookup;
mod resolve;
mod shuffle;

pub use shuffle::{ArgLocation, ShuffleEntry, DELEGATE_METHOD_PTR_AUX};

/// Bits a stub ORs into the cell register before entering the resolver.
pub mod flags {
    /// The dispatch stub at this cell missed too often; promote the cell.
    pub const BACKPATCH: u64 = 0x1;
    /// The resolve stub keeps hitting one type; consider a dispatch stub again.
    pub const DOWNGRADE: u64 = 0x2;
    /// Cells are word aligned, so the low three bits are free.
    pub const MASK: u64 = 0x7;
}

/// Per-resolve-stub counter block in the data heap.
pub mod counters {
    /// Remaining dispatch misses before promotion; signed.
    pub const MISSES: i32 = 0;
    /// Type of the current run of cache hits.
    pub const STREAK_TYPE: i32 = 8;
    /// Hits of `STREAK_TYPE` left before a downgrade is requested; signed.
    pub const STREAK_REMAINING: i32 = 16;
    pub const SIZE: u64 = 24;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupStub {
    pub entry: Address,
    pub token: DispatchToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStub {
    pub entry: Address,
    pub expected_type: Address,
    pub target: Address,
    pub fail_target: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveStub {
    pub resolve_entry: Address,
    pub slow_entry: Address,
    pub fail_entry: Address,
    pub counters: Address,
    pub token: DispatchToken,
    pub hashed_token: u64,
}

/// Everything a resolve stub embeds.
#[derive(Debug, Clone, Copy)]
pub struct ResolveStubParams {
    pub token: DispatchToken,
    /// Pre-scaled by the bucket pointer size.
    pub hashed_token: u64,
    /// Pre-scaled by the bucket pointer size.
    pub cache_mask: u64,
    pub buckets: Address,
    pub resolver: Address,
    /// Block of [`counters::SIZE`] bytes, initialised by the caller.
    pub counters: Address,
    /// Same-type hits tolerated before a downgrade is requested.
    pub downgrade_streak: u32,
}

#[derive(Debug, Clone)]
pub struct InstantiatingStub {
    pub entry: Address,
    pub dictionary: u64,
    pub target: Address,
}

/// Emits and installs stubs into the code heap.
pub struct StubGenerator {
    heap: Arc<CodeHeap>,
    isa: Isa,
    metrics: Arc<StubMetrics>,
}

impl StubGenerator {
    pub fn new(heap: Arc<CodeHeap>, isa: Isa, metrics: Arc<StubMetrics>) -> Self {
        Self { heap, isa, metrics }
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn heap(&self) -> &Arc<CodeHeap> {
        &self.heap
    }

    pub fn lookup(&self, token: DispatchToken, resolver: Address) -> Result<LookupStub, EmitError> {
        let mut asm = Assembler::new(self.isa);
        lookup::emit(&mut asm, token, resolver);
        let stub = self.heap.install(&asm.finish()?, CodeKind::Stub)?;
        self.metrics.record_stub_created(StubKind::Lookup);
        debug!(entry = %stub.rx, %token, "created lookup stub");
        Ok(LookupStub {
            entry: stub.rx,
            token,
        })
    }

    pub fn dispatch(
        &self,
        expected_type: Address,
        target: Address,
        fail_target: Address,
    ) -> Result<DispatchStub, EmitError> {
        let mut asm = Assembler::new(self.isa);
        dispatch::emit(&mut asm, expected_type, target, fail_target)?;
        let stub = self.heap.install(&asm.finish()?, CodeKind::Stub)?;
        self.metrics.record_stub_created(StubKind::Dispatch);
        debug!(entry = %stub.rx, %expected_type, %target, "created dispatch stub");
        Ok(DispatchStub {
            entry: stub.rx,
            expected_type,
            target,
            fail_target,
        })
    }

    pub fn resolve(&self, params: &ResolveStubParams) -> Result<ResolveStub, EmitError> {
        let mut asm = Assembler::new(self.isa);
        let entries = resolve::emit(&mut asm, params)?;
        let code = asm.finish()?;
        let stub = self.heap.install(&code, CodeKind::Stub)?;
        self.metrics.record_stub_created(StubKind::Resolve);

        let stub = ResolveStub {
            resolve_entry: stub.rx_at(code.label_offset(entries.resolve)),
            slow_entry: stub.rx_at(code.label_offset(entries.slow)),
            fail_entry: stub.rx_at(code.label_offset(entries.fail)),
            counters: params.counters,
            token: params.token,
            hashed_token: params.hashed_token,
        };
        debug!(
            resolve = %stub.resolve_entry,
            slow = %stub.slow_entry,
            fail = %stub.fail_entry,
            token = %params.token,
            "created resolve stub"
        );
        Ok(stub)
    }

    /// Thunk that invokes a static method through a delegate whose `this` is
    /// the delegate object itself.
    pub fn shuffle_thunk(&self, entries: &[ShuffleEntry]) -> Result<Address, EmitError> {
        let mut asm = Assembler::new(self.isa);
        shuffle::emit_delegate_thunk(&mut asm, entries)?;
        let stub = self.heap.install(&asm.finish()?, CodeKind::Stub)?;
        self.metrics.record_stub_created(StubKind::Shuffle);
        debug!(entry = %stub.rx, moves = entries.len(), "created shuffle thunk");
        Ok(stub.rx)
    }

    /// Stub that supplies the hidden generic dictionary argument before
    /// entering shared generic code.
    pub fn instantiating(
        &self,
        entries: &[ShuffleEntry],
        hidden: ArgLocation,
        dictionary: u64,
        target: Address,
    ) -> Result<InstantiatingStub, EmitError> {
        let mut asm = Assembler::new(self.isa);
        shuffle::emit_instantiating(&mut asm, entries, hidden, dictionary, target)?;
        let stub = self.heap.install(&asm.finish()?, CodeKind::Stub)?;
        self.metrics.record_stub_created(StubKind::Instantiating);
        debug!(entry = %stub.rx, dictionary, %target, isa = self.isa.name(), "created instantiating stub");
        Ok(InstantiatingStub {
            entry: stub.rx,
            dictionary,
            target,
        })
    }
}
