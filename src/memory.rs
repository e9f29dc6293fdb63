//! Simulated process address space.
//!
//! Every byte the stubs touch lives here: heap objects, type descriptors,
//! indirection cells, the resolve cache and the generated code itself. Storage
//! is made of `AtomicU64` words, so concurrent readers and writers never race
//! in the Rust sense; instead they observe exactly the tearing behaviour the
//! real hardware would give them. A word store is the unit of publication.
//!
//! ## Layout
//!
//! | Range                         | Contents                                   |
//! |-------------------------------|--------------------------------------------|
//! | `0 .. NULL_PAGE_LIMIT`        | null page, every access faults             |
//! | `DATA_BASE ..`                | data heap (read/write)                     |
//! | `CODE_BASE ..`                | code heap, executable view                 |
//! | `CODE_WRITABLE_ALIAS ..`      | code heap, writable view (W^X only)        |
//! | `NATIVE_BASE .. NATIVE_LIMIT` | native entry points, never backed          |
use crate::{
    error::{Access, Fault},
    sync::{Arc, AtomicU64, Ordering},
};
use serde::Serialize;
use std::{
    fmt::{self, Display, Formatter},
    ops::{Add, Range, Sub},
};
use tracing::trace;

pub const NULL_PAGE_LIMIT: u64 = 0x1_0000;
pub const DATA_BASE: u64 = 0x1000_0000;
pub const CODE_BASE: u64 = 0x4000_0000;
pub const CODE_WRITABLE_ALIAS: u64 = 0x6000_0000;
pub const NATIVE_BASE: u64 = 0x7f00_0000;
pub const NATIVE_LIMIT: u64 = 0x8000_0000;
/// Spacing between consecutive native entry points.
pub const NATIVE_ENTRY_STRIDE: u64 = 16;
pub const WORD_SIZE: u64 = 8;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Address(pub u64);

impl Address {
    pub const NULL: Self = Address(0);

    pub const fn new(raw: u64) -> Self {
        Address(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, delta: i64) -> Self {
        Address(self.0.wrapping_add_signed(delta))
    }

    pub fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    pub fn is_aligned(self, align: u64) -> bool {
        self.0 % align == 0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(raw: u64) -> Self {
        Address(raw)
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl Add<u64> for Address {
    type Output = Self;
    fn add(self, rhs: u64) -> Self {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<Address> for Address {
    type Output = u64;
    fn sub(self, rhs: Address) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
    pub const READ_EXECUTE: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const READ_WRITE_EXECUTE: Self = Self {
        read: true,
        write: true,
        execute: true,
    };

    fn allows(self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
            Access::Execute => self.execute,
        }
    }
}

struct Region {
    name: &'static str,
    base: u64,
    len: u64,
    storage: Arc<[AtomicU64]>,
    protection: Protection,
}

impl Region {
    fn new(name: &'static str, base: u64, storage: Arc<[AtomicU64]>, protection: Protection) -> Self {
        let len = storage.len() as u64 * WORD_SIZE;
        Self {
            name,
            base,
            len,
            storage,
            protection,
        }
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.len
    }
}

/// Sizes of the backed regions of an [`AddressSpace`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    pub data_bytes: u64,
    pub code_bytes: u64,
    pub write_xor_execute: bool,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            data_bytes: 4 << 20,
            code_bytes: 1 << 20,
            write_xor_execute: true,
        }
    }
}

fn zeroed_words(bytes: u64) -> Arc<[AtomicU64]> {
    let words = bytes.div_ceil(WORD_SIZE) as usize;
    (0..words).map(|_| AtomicU64::new(0)).collect()
}

pub struct AddressSpace {
    regions: Vec<Region>,
    data_next: AtomicU64,
    data_end: u64,
    code_len: u64,
    native_next: AtomicU64,
    write_xor_execute: bool,
}

impl AddressSpace {
    pub fn new(layout: MemoryLayout) -> Arc<Self> {
        let data = zeroed_words(layout.data_bytes);
        let code = zeroed_words(layout.code_bytes);

        let mut regions = vec![Region::new("data", DATA_BASE, data, Protection::READ_WRITE)];
        if layout.write_xor_execute {
            regions.push(Region::new(
                "code-rx",
                CODE_BASE,
                code.clone(),
                Protection::READ_EXECUTE,
            ));
            regions.push(Region::new(
                "code-rw",
                CODE_WRITABLE_ALIAS,
                code,
                Protection::READ_WRITE,
            ));
        } else {
            regions.push(Region::new(
                "code-rwx",
                CODE_BASE,
                code,
                Protection::READ_WRITE_EXECUTE,
            ));
        }

        let data_end = DATA_BASE + regions[0].len;
        let code_len = regions[1].len;
        Arc::new(Self {
            regions,
            // The first data word stays unused so no allocation ever lands on the base.
            data_next: AtomicU64::new(DATA_BASE + WORD_SIZE),
            data_end,
            code_len,
            // NATIVE_BASE itself is kept for the resolver entry.
            native_next: AtomicU64::new(NATIVE_BASE + NATIVE_ENTRY_STRIDE),
            write_xor_execute: layout.write_xor_execute,
        })
    }

    pub fn write_xor_execute(&self) -> bool {
        self.write_xor_execute
    }

    pub fn data_range(&self) -> Range<Address> {
        Address(DATA_BASE)..Address(self.data_end)
    }

    pub fn code_range(&self) -> Range<Address> {
        Address(CODE_BASE)..Address(CODE_BASE + self.code_len)
    }

    /// Translate an executable code address to the address writes must go through.
    pub fn writable_alias(&self, executable: Address) -> Address {
        if self.write_xor_execute {
            Address(executable.0 - CODE_BASE + CODE_WRITABLE_ALIAS)
        } else {
            executable
        }
    }

    /// The fixed native address jitted code reaches the resolver through.
    pub fn resolver_entry(&self) -> Address {
        Address(NATIVE_BASE)
    }

    pub fn is_native_entry(&self, address: Address) -> bool {
        (NATIVE_BASE..NATIVE_LIMIT).contains(&address.0)
    }

    /// Reserve a fresh native entry point (method bodies live outside the simulation).
    pub fn reserve_native_entry(&self) -> Result<Address, Fault> {
        let entry = self
            .native_next
            .fetch_add(NATIVE_ENTRY_STRIDE, Ordering::Relaxed);
        if entry >= NATIVE_LIMIT {
            return Err(Fault::OutOfMemory {
                requested: NATIVE_ENTRY_STRIDE,
            });
        }
        Ok(Address(entry))
    }

    /// Bump-allocate zeroed data heap memory. Memory is never reclaimed.
    pub fn allocate_data(&self, bytes: u64, align: u64) -> Result<Address, Fault> {
        let align = align.max(WORD_SIZE);
        let size = bytes.max(1).div_ceil(WORD_SIZE) * WORD_SIZE;
        let mut current = self.data_next.load(Ordering::Relaxed);
        loop {
            let start = Address(current).align_up(align).0;
            let end = start
                .checked_add(size)
                .ok_or(Fault::OutOfMemory { requested: bytes })?;
            if end > self.data_end {
                return Err(Fault::OutOfMemory { requested: bytes });
            }
            match self.data_next.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    trace!(address = %Address(start), bytes, "allocated data block");
                    return Ok(Address(start));
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn data_bytes_used(&self) -> u64 {
        self.data_next.load(Ordering::Relaxed) - DATA_BASE
    }

    fn slot(&self, address: Address, width: u8, access: Access) -> Result<(&AtomicU64, u32), Fault> {
        if address.0 < NULL_PAGE_LIMIT {
            return Err(Fault::NullReference { address });
        }
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(address.0))
            .ok_or(Fault::Unmapped { address })?;
        if address.0 % width as u64 != 0 {
            return Err(Fault::Misaligned { address, width });
        }
        if !region.protection.allows(access) {
            trace!(region = region.name, %address, %access, "protection fault");
            return Err(Fault::AccessDenied { address, access });
        }
        let offset = address.0 - region.base;
        let word = &region.storage[(offset / WORD_SIZE) as usize];
        Ok((word, ((offset % WORD_SIZE) * 8) as u32))
    }

    fn store_bits(word: &AtomicU64, shift: u32, mask: u64, value: u64) {
        let _ = word.fetch_update(Ordering::Release, Ordering::Relaxed, |current| {
            Some((current & !(mask << shift)) | ((value & mask) << shift))
        });
    }

    pub fn load_word(&self, address: Address) -> Result<u64, Fault> {
        let (word, _) = self.slot(address, 8, Access::Read)?;
        Ok(word.load(Ordering::Acquire))
    }

    pub fn store_word(&self, address: Address, value: u64) -> Result<(), Fault> {
        let (word, _) = self.slot(address, 8, Access::Write)?;
        word.store(value, Ordering::Release);
        Ok(())
    }

    pub fn compare_exchange_word(
        &self,
        address: Address,
        expected: u64,
        new: u64,
    ) -> Result<Result<u64, u64>, Fault> {
        let (word, _) = self.slot(address, 8, Access::Write)?;
        Ok(word.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire))
    }

    pub fn load_u32(&self, address: Address) -> Result<u32, Fault> {
        let (word, shift) = self.slot(address, 4, Access::Read)?;
        Ok((word.load(Ordering::Acquire) >> shift) as u32)
    }

    pub fn store_u32(&self, address: Address, value: u32) -> Result<(), Fault> {
        let (word, shift) = self.slot(address, 4, Access::Write)?;
        Self::store_bits(word, shift, u32::MAX as u64, value as u64);
        Ok(())
    }

    pub fn load_u8(&self, address: Address) -> Result<u8, Fault> {
        let (word, shift) = self.slot(address, 1, Access::Read)?;
        Ok((word.load(Ordering::Acquire) >> shift) as u8)
    }

    pub fn store_u8(&self, address: Address, value: u8) -> Result<(), Fault> {
        let (word, shift) = self.slot(address, 1, Access::Write)?;
        Self::store_bits(word, shift, u8::MAX as u64, value as u64);
        Ok(())
    }

    /// Instruction fetch: a 32-bit read that requires execute permission.
    pub fn fetch_unit(&self, address: Address) -> Result<u32, Fault> {
        let (word, shift) = self.slot(address, 4, Access::Execute)?;
        Ok((word.load(Ordering::Acquire) >> shift) as u32)
    }

    /// Literal fetch for instructions that carry a full word after their opcode.
    pub fn fetch_literal(&self, address: Address) -> Result<u64, Fault> {
        let (word, _) = self.slot(address, 8, Access::Execute)?;
        Ok(word.load(Ordering::Acquire))
    }

    /// Copy `len` bytes between word-aligned ranges, word by word.
    pub fn copy_words(&self, dst: Address, src: Address, len: u64) -> Result<(), Fault> {
        debug_assert!(len % WORD_SIZE == 0);
        for offset in (0..len).step_by(WORD_SIZE as usize) {
            let value = self.load_word(src + offset)?;
            self.store_word(dst + offset, value)?;
        }
        Ok(())
    }
}
