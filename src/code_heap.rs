//! Executable memory for generated code and the map of who owns which range.
use crate::{
    arch::UNIT_SIZE,
    assembler::AssembledCode,
    error::{EmitError, Fault},
    execution_control::Strategy,
    memory::{Address, AddressSpace},
    metrics::StubMetrics,
    sync::{fence, Arc, AtomicU64, Ordering, RwLock},
};
use std::ops::Range;
use tracing::trace;

/// Every stub starts on this boundary so wide literals stay word aligned.
pub const STUB_ALIGNMENT: u64 = 16;

/// The two views of one stub allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubAllocation {
    /// Address code executes from.
    pub rx: Address,
    /// Address writes go through.
    pub rw: Address,
    pub size: u64,
}

impl StubAllocation {
    pub fn range(&self) -> Range<Address> {
        self.rx..self.rx + self.size
    }

    pub fn rw_at(&self, offset: u64) -> Address {
        self.rw + offset
    }

    pub fn rx_at(&self, offset: u64) -> Address {
        self.rx + offset
    }
}

/// What lives in a registered code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Frameless runtime stub; the caller's return address stays in `lr`.
    Stub,
    /// Write barrier code (templates and published entry points).
    Barrier,
    /// Code produced by one of the managed execution strategies.
    Managed(Strategy),
    /// Native code with a frame-pointer chain that saved `saved_registers`
    /// callee-saved registers below the frame record.
    Native { saved_registers: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub start: Address,
    pub end: Address,
    pub kind: CodeKind,
}

impl CodeRange {
    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && address < self.end
    }
}

/// Sorted, non-overlapping code ranges. Lookups never allocate.
#[derive(Debug, Default)]
pub struct CodeMap {
    ranges: RwLock<Vec<CodeRange>>,
}

impl CodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, range: Range<Address>, kind: CodeKind) {
        let entry = CodeRange {
            start: range.start,
            end: range.end,
            kind,
        };
        let mut ranges = self.ranges.write();
        let at = ranges.partition_point(|r| r.start < entry.start);
        debug_assert!(
            ranges.get(at).map_or(true, |next| next.start >= entry.end),
            "code range {entry:?} overlaps an existing range"
        );
        ranges.insert(at, entry);
    }

    pub fn lookup(&self, address: Address) -> Option<CodeRange> {
        let ranges = self.ranges.read();
        let at = ranges.partition_point(|r| r.start <= address);
        at.checked_sub(1)
            .map(|i| ranges[i])
            .filter(|r| r.contains(address))
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bump allocator over the code region of an [`AddressSpace`].
pub struct CodeHeap {
    memory: Arc<AddressSpace>,
    metrics: Arc<StubMetrics>,
    next: AtomicU64,
    end: u64,
    map: CodeMap,
}

impl CodeHeap {
    pub fn new(memory: Arc<AddressSpace>, metrics: Arc<StubMetrics>) -> Self {
        let range = memory.code_range();
        Self {
            memory,
            metrics,
            next: AtomicU64::new(range.start.as_u64()),
            end: range.end.as_u64(),
            map: CodeMap::new(),
        }
    }

    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.memory
    }

    pub fn code_map(&self) -> &CodeMap {
        &self.map
    }

    pub fn bytes_used(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - self.memory.code_range().start.as_u64()
    }

    pub fn allocate_stub(&self, size: u64, alignment: u64) -> Result<StubAllocation, EmitError> {
        let alignment = alignment.max(STUB_ALIGNMENT);
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let start = Address(current).align_up(alignment).as_u64();
            let end = start + size;
            if end > self.end {
                return Err(EmitError::OutOfCodeSpace {
                    requested: size,
                    available: self.end.saturating_sub(start),
                });
            }
            match self
                .next
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let rx = Address(start);
                    return Ok(StubAllocation {
                        rx,
                        rw: self.memory.writable_alias(rx),
                        size,
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Copy raw units through the writable view.
    pub fn write_units(&self, rw: Address, units: &[u32]) -> Result<(), Fault> {
        for (i, unit) in units.iter().enumerate() {
            self.memory.store_u32(rw + i as u64 * UNIT_SIZE, *unit)?;
        }
        Ok(())
    }

    pub fn write_code(&self, allocation: &StubAllocation, code: &AssembledCode) -> Result<(), EmitError> {
        if code.len_bytes() > allocation.size {
            return Err(EmitError::SlotTooSmall {
                needed: code.len_bytes(),
                capacity: allocation.size,
            });
        }
        self.write_units(allocation.rw, &code.units)?;
        Ok(())
    }

    /// Allocate, write, register and flush in one go.
    pub fn install(&self, code: &AssembledCode, kind: CodeKind) -> Result<StubAllocation, EmitError> {
        let allocation = self.allocate_stub(code.len_bytes(), STUB_ALIGNMENT)?;
        self.write_code(&allocation, code)?;
        self.map.register(allocation.range(), kind);
        self.flush_instruction_cache(allocation.range());
        Ok(allocation)
    }

    /// Make prior code writes visible to instruction fetch on every core.
    pub fn flush_instruction_cache(&self, range: Range<Address>) {
        fence(Ordering::SeqCst);
        self.metrics.record_icache_flush();
        trace!(start = %range.start, end = %range.end, "flushed instruction cache");
    }
}
