//! Write barrier patch table.
//!
//! Jitted code calls one published entry point per [`BarrierKind`]. The
//! published code is a copy of one of the variants emitted at startup; which
//! variant depends on the processor count and on whether the heap has grown
//! past its initial reservation. Every variant embeds the GC globals it needs
//! as patchable immediates, and a [`WriteBarrierDescriptor`] records where.
//!
//! Swapping variants rewrites whole instruction sequences, so it only ever
//! happens with every mutator parked at a safe point. A value-only refresh of
//! the active variants is the caller's to sequence.
use crate::{
    arch::{InstructionSet, Isa, UNIT_SIZE},
    assembler::Assembler,
    code_heap::{CodeHeap, CodeKind, StubAllocation, STUB_ALIGNMENT},
    config::StubConfig,
    error::{BarrierError, Fault},
    machine::{Context, Exit, Machine},
    memory::{Address, AddressSpace},
    metrics::StubMetrics,
    sync::{Arc, Mutex},
    threading::{SuspensionGuard, ThreadManager},
};
use serde::Serialize;
use std::{
    fmt,
    ops::{BitOr, BitOrAssign, Range},
    time::Instant,
};
use tracing::{debug, trace};

mod codegen;

/// One card covers this many address bits.
pub const CARD_SHIFT: u32 = 10;
/// One write-watch byte covers a page.
pub const WRITE_WATCH_SHIFT: u32 = 12;
pub const CARD_MARKED: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GcGlobal {
    LowestAddress,
    HighestAddress,
    EphemeralLow,
    EphemeralHigh,
    CardTable,
    WriteWatchTable,
}

impl GcGlobal {
    pub const COUNT: usize = 6;
    pub const ALL: [GcGlobal; Self::COUNT] = [
        GcGlobal::LowestAddress,
        GcGlobal::HighestAddress,
        GcGlobal::EphemeralLow,
        GcGlobal::EphemeralHigh,
        GcGlobal::CardTable,
        GcGlobal::WriteWatchTable,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BarrierKind {
    /// Destination known to be in the heap.
    Write,
    /// Destination may be outside the heap.
    Checked,
    /// Copies `[r1]` to `[r0]` and advances both.
    ByRef,
}

impl BarrierKind {
    pub const ALL: [BarrierKind; 3] = [BarrierKind::Write, BarrierKind::Checked, BarrierKind::ByRef];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Processors {
    Single,
    Multi,
}

impl Processors {
    pub fn for_count(count: usize) -> Self {
        if count > 1 {
            Processors::Multi
        } else {
            Processors::Single
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HeapGrowth {
    /// The ephemeral range ends the heap, so no upper bound check.
    PreGrow,
    PostGrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BarrierFlavor {
    pub processors: Processors,
    pub growth: HeapGrowth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BarrierVariant {
    pub kind: BarrierKind,
    pub flavor: BarrierFlavor,
    /// Also maintains the software write-watch table.
    pub write_watch: bool,
}

impl BarrierVariant {
    pub fn all() -> impl Iterator<Item = BarrierVariant> {
        BarrierKind::ALL.into_iter().flat_map(|kind| {
            [Processors::Single, Processors::Multi]
                .into_iter()
                .flat_map(move |processors| {
                    [HeapGrowth::PreGrow, HeapGrowth::PostGrow]
                        .into_iter()
                        .flat_map(move |growth| {
                            [false, true].into_iter().map(move |write_watch| BarrierVariant {
                                kind,
                                flavor: BarrierFlavor { processors, growth },
                                write_watch,
                            })
                        })
                })
        })
    }

    pub fn references(&self, global: GcGlobal) -> bool {
        match global {
            GcGlobal::LowestAddress | GcGlobal::HighestAddress => self.kind != BarrierKind::Write,
            GcGlobal::EphemeralLow | GcGlobal::CardTable => true,
            GcGlobal::EphemeralHigh => self.flavor.growth == HeapGrowth::PostGrow,
            GcGlobal::WriteWatchTable => self.write_watch,
        }
    }
}

/// Where one emitted variant lives and where its embedded globals are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBarrierDescriptor {
    pub variant: BarrierVariant,
    pub start: Address,
    pub end: Address,
    /// Byte offset from `start` of each global's immediate site.
    pub offsets: [Option<u64>; GcGlobal::COUNT],
}

impl WriteBarrierDescriptor {
    pub fn offset_of(&self, global: GcGlobal) -> Option<u64> {
        self.offsets[global.index()]
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The values the barriers embed. Table bases are biased so that
/// `table + (address >> shift)` addresses the entry for `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeapBounds {
    pub lowest: Address,
    pub highest: Address,
    pub ephemeral_low: Address,
    pub ephemeral_high: Address,
    pub card_table: Address,
    pub write_watch_table: Address,
}

impl HeapBounds {
    /// Allocate card and write-watch tables covering `heap` and treat the
    /// whole range as ephemeral.
    pub fn allocate_for(memory: &AddressSpace, heap: Range<Address>) -> Result<Self, Fault> {
        let cards = ((heap.end - heap.start) >> CARD_SHIFT) + 1;
        let pages = ((heap.end - heap.start) >> WRITE_WATCH_SHIFT) + 1;
        let card_table = memory.allocate_data(cards, 8)?;
        let write_watch_table = memory.allocate_data(pages, 8)?;
        Ok(Self {
            lowest: heap.start,
            highest: heap.end,
            ephemeral_low: heap.start,
            ephemeral_high: heap.end,
            card_table: Address(
                card_table
                    .as_u64()
                    .wrapping_sub(heap.start.as_u64() >> CARD_SHIFT),
            ),
            write_watch_table: Address(
                write_watch_table
                    .as_u64()
                    .wrapping_sub(heap.start.as_u64() >> WRITE_WATCH_SHIFT),
            ),
        })
    }

    pub fn value_of(&self, global: GcGlobal) -> u64 {
        match global {
            GcGlobal::LowestAddress => self.lowest,
            GcGlobal::HighestAddress => self.highest,
            GcGlobal::EphemeralLow => self.ephemeral_low,
            GcGlobal::EphemeralHigh => self.ephemeral_high,
            GcGlobal::CardTable => self.card_table,
            GcGlobal::WriteWatchTable => self.write_watch_table,
        }
        .as_u64()
    }

    pub fn card_for(&self, slot: Address) -> Address {
        Address(self.card_table.as_u64().wrapping_add(slot.as_u64() >> CARD_SHIFT))
    }

    pub fn write_watch_for(&self, slot: Address) -> Address {
        Address(
            self.write_watch_table
                .as_u64()
                .wrapping_add(slot.as_u64() >> WRITE_WATCH_SHIFT),
        )
    }
}

/// What the caller of a stomp operation still has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StompActions(u8);

impl StompActions {
    pub const PASS: Self = Self(0);
    /// Published code changed; flush the instruction cache.
    pub const ICACHE_FLUSH: Self = Self(1);
    /// Mutators were suspended for the change and must be resumed.
    pub const RESTART: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for StompActions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StompActions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for StompActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (
            self.contains(Self::ICACHE_FLUSH),
            self.contains(Self::RESTART),
        ) {
            (false, false) => write!(f, "pass"),
            (true, false) => write!(f, "icache-flush"),
            (false, true) => write!(f, "restart"),
            (true, true) => write!(f, "icache-flush|restart"),
        }
    }
}

/// Result of a stomp that may have suspended mutators on the caller's behalf.
///
/// [`StompOutcome::finish`] performs the pending actions. Dropping it without
/// finishing still resumes mutators but skips the flush.
#[must_use]
pub struct StompOutcome<'a> {
    manager: &'a WriteBarrierManager,
    actions: StompActions,
    guard: Option<SuspensionGuard<'a>>,
}

impl StompOutcome<'_> {
    pub fn actions(&self) -> StompActions {
        self.actions
    }

    /// True when the manager itself suspended mutators for this stomp.
    pub fn suspended(&self) -> bool {
        self.guard.is_some()
    }

    pub fn finish(self) {
        if self.actions.contains(StompActions::ICACHE_FLUSH) {
            self.manager.flush_instruction_cache();
        }
        drop(self.guard);
    }
}

impl fmt::Debug for StompOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StompOutcome")
            .field("actions", &self.actions)
            .field("suspended", &self.guard.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BarrierState {
    bounds: HeapBounds,
    reserved: (Address, Address),
    processors: Processors,
    growth: HeapGrowth,
    write_watch: bool,
    /// Descriptor index copied into each published entry point.
    active: [Option<usize>; 3],
}

impl BarrierState {
    fn variant_for(&self, kind: BarrierKind) -> BarrierVariant {
        BarrierVariant {
            kind,
            flavor: BarrierFlavor {
                processors: self.processors,
                growth: self.growth,
            },
            write_watch: self.write_watch,
        }
    }
}

pub struct WriteBarrierManager {
    heap: Arc<CodeHeap>,
    isa: Isa,
    threads: Arc<ThreadManager>,
    metrics: Arc<StubMetrics>,
    step_limit: u64,
    descriptors: Vec<WriteBarrierDescriptor>,
    published: [StubAllocation; 3],
    state: Mutex<BarrierState>,
}

impl WriteBarrierManager {
    /// Emit every variant, reserve the published entry points and install
    /// the variants matching `config` and `bounds`.
    pub fn new(
        config: &StubConfig,
        heap: Arc<CodeHeap>,
        threads: Arc<ThreadManager>,
        metrics: Arc<StubMetrics>,
        bounds: HeapBounds,
    ) -> Result<Self, BarrierError> {
        let isa = Isa::from(config.isa);

        let mut descriptors = Vec::new();
        for variant in BarrierVariant::all() {
            let mut asm = Assembler::new(isa);
            let sites = codegen::emit(&mut asm, variant)?;
            let code = asm.finish()?;
            let template = heap.install(&code, CodeKind::Barrier)?;
            descriptors.push(WriteBarrierDescriptor {
                variant,
                start: template.rx,
                end: template.rx + code.len_bytes(),
                offsets: sites.map(|site| site.map(|s| code.site_offset(s))),
            });
        }

        let mut published = Vec::with_capacity(BarrierKind::ALL.len());
        for kind in BarrierKind::ALL {
            let size = descriptors
                .iter()
                .filter(|d| d.variant.kind == kind)
                .map(WriteBarrierDescriptor::len)
                .max()
                .unwrap_or(UNIT_SIZE);
            let slot = heap.allocate_stub(size, STUB_ALIGNMENT)?;
            heap.code_map().register(slot.range(), CodeKind::Barrier);
            published.push(slot);
        }
        let published: [StubAllocation; 3] = [published[0], published[1], published[2]];

        let manager = Self {
            heap,
            isa,
            threads,
            metrics,
            step_limit: config.step_limit,
            descriptors,
            published,
            state: Mutex::new(BarrierState {
                bounds,
                reserved: (bounds.lowest, bounds.highest),
                processors: Processors::for_count(config.processor_count),
                growth: HeapGrowth::PreGrow,
                write_watch: config.software_write_watch,
                active: [None; 3],
            }),
        };

        {
            let mut state = manager.state.lock();
            manager.apply(&mut state)?;
        }
        manager.flush_instruction_cache();
        debug!(
            variants = manager.descriptors.len(),
            isa = isa.name(),
            "write barriers installed"
        );
        Ok(manager)
    }

    pub fn descriptors(&self) -> &[WriteBarrierDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, variant: BarrierVariant) -> Option<&WriteBarrierDescriptor> {
        self.descriptors.iter().find(|d| d.variant == variant)
    }

    /// The published entry point for `kind`. Never changes.
    pub fn entry(&self, kind: BarrierKind) -> Address {
        self.published[kind.index()].rx
    }

    pub fn active_variant(&self, kind: BarrierKind) -> Option<BarrierVariant> {
        self.state.lock().active[kind.index()].map(|i| self.descriptors[i].variant)
    }

    pub fn bounds(&self) -> HeapBounds {
        self.state.lock().bounds
    }

    /// The value currently embedded in the published `kind` barrier for
    /// `global`, or `None` if the active variant does not use it.
    pub fn embedded_value(
        &self,
        kind: BarrierKind,
        global: GcGlobal,
    ) -> Result<Option<u64>, BarrierError> {
        let active = self.state.lock().active[kind.index()];
        let index = active.ok_or(BarrierError::NoActiveVariant(kind))?;
        match self.descriptors[index].offset_of(global) {
            Some(offset) => {
                let site = self.published[kind.index()].rx_at(offset);
                Ok(Some(self.isa.read_immediate(self.heap.memory(), site)?))
            }
            None => Ok(None),
        }
    }

    /// Raw units of the published `kind` barrier.
    pub fn published_code(&self, kind: BarrierKind) -> Result<Vec<u32>, Fault> {
        let slot = self.published[kind.index()];
        (0..slot.size / UNIT_SIZE)
            .map(|i| self.heap.memory().load_u32(slot.rx + i * UNIT_SIZE))
            .collect()
    }

    fn variant_index(&self, variant: BarrierVariant) -> Result<usize, BarrierError> {
        self.descriptors
            .iter()
            .position(|d| d.variant == variant)
            .ok_or(BarrierError::NoActiveVariant(variant.kind))
    }

    fn swap_needed(&self, state: &BarrierState) -> Result<bool, BarrierError> {
        for kind in BarrierKind::ALL {
            let wanted = self.variant_index(state.variant_for(kind))?;
            if state.active[kind.index()] != Some(wanted) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn copy_variant(&self, kind: BarrierKind, index: usize) -> Result<(), BarrierError> {
        let memory = self.heap.memory();
        let template = &self.descriptors[index];
        let slot = self.published[kind.index()];
        let mut offset = 0;
        while offset < slot.size {
            let unit = if offset < template.len() {
                memory.load_u32(template.start + offset)?
            } else {
                self.isa.breakpoint_unit()
            };
            memory.store_u32(slot.rw_at(offset), unit)?;
            offset += UNIT_SIZE;
        }
        Ok(())
    }

    /// Rewrite every embedded global whose value differs. Returns whether
    /// any code changed.
    fn refresh(&self, state: &BarrierState) -> Result<bool, BarrierError> {
        let memory = self.heap.memory();
        let mut changed = false;
        for kind in BarrierKind::ALL {
            let Some(index) = state.active[kind.index()] else {
                continue;
            };
            let slot = self.published[kind.index()];
            for global in GcGlobal::ALL {
                let Some(offset) = self.descriptors[index].offset_of(global) else {
                    continue;
                };
                let value = state.bounds.value_of(global);
                if self.isa.read_immediate(memory, slot.rx_at(offset))? != value {
                    self.isa.patch_immediate(memory, slot.rw_at(offset), value)?;
                    trace!(?kind, ?global, value = format_args!("{value:#x}"), "patched barrier immediate");
                    changed = true;
                }
            }
        }
        if changed {
            self.metrics.record_barrier_refresh();
        }
        Ok(changed)
    }

    /// Bring the published code in line with `state`: copy any variant that
    /// should change, then refresh embedded globals.
    fn apply(&self, state: &mut BarrierState) -> Result<StompActions, BarrierError> {
        let mut actions = StompActions::PASS;
        for kind in BarrierKind::ALL {
            let wanted = self.variant_index(state.variant_for(kind))?;
            if state.active[kind.index()] == Some(wanted) {
                continue;
            }
            self.copy_variant(kind, wanted)?;
            state.active[kind.index()] = Some(wanted);
            self.metrics.record_barrier_swap();
            actions |= StompActions::ICACHE_FLUSH;
            debug!(?kind, variant = ?self.descriptors[wanted].variant, "swapped write barrier");
        }
        if self.refresh(state)? {
            actions |= StompActions::ICACHE_FLUSH;
        }
        Ok(actions)
    }

    fn suspend(&self) -> SuspensionGuard<'_> {
        let started = Instant::now();
        let guard = self.threads.suspend_all();
        self.metrics.record_suspension(started.elapsed());
        guard
    }

    /// Apply `change` to the barrier state, suspending mutators first if the
    /// change requires a variant swap and the caller has not suspended them.
    fn stomp(&self, change: impl Fn(&mut BarrierState)) -> Result<StompOutcome<'_>, BarrierError> {
        let mut guard = None;
        loop {
            let mut state = self.state.lock();
            let mut next = *state;
            change(&mut next);

            if guard.is_none() && !self.threads.is_suspended() && self.swap_needed(&next)? {
                drop(state);
                guard = Some(self.suspend());
                continue;
            }

            *state = next;
            let mut actions = self.apply(&mut state)?;
            if guard.is_some() {
                actions |= StompActions::RESTART;
            }
            return Ok(StompOutcome {
                manager: self,
                actions,
                guard,
            });
        }
    }

    /// Re-select variants for the current processor policy and `post_grow`,
    /// then refresh embedded globals. A variant swap suspends mutators unless
    /// the caller already holds the suspension.
    pub fn update(&self, post_grow: bool) -> Result<StompOutcome<'_>, BarrierError> {
        self.stomp(|state| {
            if post_grow {
                state.growth = HeapGrowth::PostGrow;
            }
        })
    }

    /// New heap bounds, possibly requiring the upper bound check.
    pub fn stomp_resize(
        &self,
        bounds: HeapBounds,
        requires_upper_bounds_check: bool,
    ) -> Result<StompOutcome<'_>, BarrierError> {
        self.stomp(|state| {
            state.bounds = bounds;
            if requires_upper_bounds_check {
                state.growth = HeapGrowth::PostGrow;
            }
        })
    }

    /// Value-only refresh of the ephemeral range. Mutators must already be
    /// stopped, as they are during a collection.
    pub fn stomp_ephemeral(
        &self,
        ephemeral_low: Address,
        ephemeral_high: Address,
    ) -> Result<StompActions, BarrierError> {
        debug_assert!(
            self.threads.is_suspended() || self.threads.thread_count() == 0,
            "ephemeral bounds refreshed while mutators may be running barriers"
        );
        let mut state = self.state.lock();
        state.bounds.ephemeral_low = ephemeral_low;
        state.bounds.ephemeral_high = ephemeral_high;
        Ok(if self.refresh(&state)? {
            StompActions::ICACHE_FLUSH
        } else {
            StompActions::PASS
        })
    }

    pub fn switch_to_write_watch(&self) -> Result<StompOutcome<'_>, BarrierError> {
        self.stomp(|state| state.write_watch = true)
    }

    pub fn switch_to_non_write_watch(&self) -> Result<StompOutcome<'_>, BarrierError> {
        self.stomp(|state| state.write_watch = false)
    }

    /// The GC moved heap boundaries. Growing past the initial reservation
    /// switches to the post-grow variants for good.
    pub fn on_heap_bounds_changed(&self, bounds: HeapBounds) -> Result<StompOutcome<'_>, BarrierError> {
        self.stomp(|state| {
            let (low, high) = state.reserved;
            if bounds.lowest < low || bounds.highest > high {
                state.growth = HeapGrowth::PostGrow;
            }
            state.bounds = bounds;
        })
    }

    pub fn on_processor_count_policy_changed(
        &self,
        processor_count: usize,
    ) -> Result<StompOutcome<'_>, BarrierError> {
        let processors = Processors::for_count(processor_count);
        self.stomp(move |state| state.processors = processors)
    }

    pub fn flush_instruction_cache(&self) {
        for slot in &self.published {
            self.heap.flush_instruction_cache(slot.range());
        }
    }

    /// Run the published `kind` barrier for `dst` and `value` (the source
    /// slot for [`BarrierKind::ByRef`]). Returns the registers afterwards.
    pub fn execute(&self, kind: BarrierKind, dst: Address, value: u64) -> Result<Context, BarrierError> {
        let mut ctx = Context::new(self.entry(kind));
        ctx.set_reg(crate::arch::regs::R0, dst.as_u64());
        ctx.set_reg(crate::arch::regs::R1, value);
        let machine = Machine::new(self.heap.memory(), self.isa, self.step_limit);
        match machine.run(&mut ctx)? {
            Exit::Return => Ok(ctx),
            Exit::Native(at) | Exit::Breakpoint(at) => Err(BarrierError::UnexpectedExit(at)),
        }
    }
}
