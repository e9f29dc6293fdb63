//! Shared resolve cache.
//!
//! A fixed, power-of-two array of bucket heads in the data heap. Each head
//! points at a singly linked chain of elements:
//!
//! ```text
//! +0  receiver type handle
//! +8  dispatch token
//! +16 target entry point
//! +24 next element (0 ends the chain)
//! ```
//!
//! Resolve stubs walk chains without any synchronization. Writers take a
//! mutex, fill an element completely, point it at the current head and only
//! then store it as the new head. Elements are never modified or freed after
//! publication; [`ResolveCache::clear`] only resets the heads.
use crate::{
    config::MAX_CACHE_BITS,
    error::{DispatchError, Fault},
    memory::{Address, AddressSpace, WORD_SIZE},
    sync::{Arc, AtomicU64, Mutex, Ordering},
    types::DispatchToken,
};
use tracing::trace;

pub mod element {
    pub const TYPE: i32 = 0;
    pub const TOKEN: i32 = 8;
    pub const TARGET: i32 = 16;
    pub const NEXT: i32 = 24;
    pub const SIZE: u64 = 32;
}

/// Shift applied to the type handle before it is folded into the bucket index.
pub const TYPE_HASH_SHIFT: u32 = 12;

/// Result of walking one bucket chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub target: Option<Address>,
    /// Elements compared before the walk stopped.
    pub comparisons: usize,
}

pub struct ResolveCache {
    memory: Arc<AddressSpace>,
    buckets: Address,
    bits: u32,
    writer: Mutex<()>,
    entries: AtomicU64,
}

impl ResolveCache {
    /// A cache of `1 << bits` buckets, `bits` in `1..=MAX_CACHE_BITS`.
    pub fn new(memory: Arc<AddressSpace>, bits: u32) -> Result<Self, DispatchError> {
        if !(1..=MAX_CACHE_BITS).contains(&bits) {
            return Err(DispatchError::InvalidCacheSize { bits });
        }
        let buckets = memory.allocate_data((1u64 << bits) * WORD_SIZE, 64)?;
        Ok(Self {
            memory,
            buckets,
            bits,
            writer: Mutex::new(()),
            entries: AtomicU64::new(0),
        })
    }

    pub fn buckets_base(&self) -> Address {
        self.buckets
    }

    pub fn bucket_count(&self) -> u64 {
        1 << self.bits
    }

    /// Index mask, scaled to bucket-pointer size.
    pub fn scaled_mask(&self) -> u64 {
        (self.bucket_count() - 1) * WORD_SIZE
    }

    /// Spread a token over the index bits. Stubs embed the result, pre-scaled.
    pub fn hash_token(&self, token: DispatchToken) -> u64 {
        let mixed = token.0.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (mixed >> (64 - self.bits)) * WORD_SIZE
    }

    /// Byte offset of the bucket for `(type_handle, token)`. Resolve stubs compute
    /// exactly this with the stub's embedded hashed token and mask.
    pub fn bucket_offset(&self, type_handle: Address, hashed_token: u64) -> u64 {
        let t = type_handle.as_u64();
        (t.wrapping_add(t >> TYPE_HASH_SHIFT) ^ hashed_token) & self.scaled_mask()
    }

    fn bucket_for(&self, type_handle: Address, token: DispatchToken) -> Address {
        self.buckets + self.bucket_offset(type_handle, self.hash_token(token))
    }

    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the chain for `(type_handle, token)`.
    pub fn lookup(&self, type_handle: Address, token: DispatchToken) -> Result<Probe, Fault> {
        let mut cursor = self.memory.load_word(self.bucket_for(type_handle, token))?;
        let mut comparisons = 0;
        while cursor != 0 {
            let at = Address(cursor);
            comparisons += 1;
            let ty = self.memory.load_word(at.offset(element::TYPE as i64))?;
            let tok = self.memory.load_word(at.offset(element::TOKEN as i64))?;
            if ty == type_handle.as_u64() && tok == token.0 {
                let target = self.memory.load_word(at.offset(element::TARGET as i64))?;
                return Ok(Probe {
                    target: Some(Address(target)),
                    comparisons,
                });
            }
            cursor = self.memory.load_word(at.offset(element::NEXT as i64))?;
        }
        Ok(Probe {
            target: None,
            comparisons,
        })
    }

    pub fn chain_len(&self, type_handle: Address, token: DispatchToken) -> Result<usize, Fault> {
        let mut cursor = self.memory.load_word(self.bucket_for(type_handle, token))?;
        let mut len = 0;
        while cursor != 0 {
            len += 1;
            cursor = self
                .memory
                .load_word(Address(cursor).offset(element::NEXT as i64))?;
        }
        Ok(len)
    }

    /// Publish `(type_handle, token) -> target` unless the pair is already cached.
    /// Returns the element that now answers for the pair and whether it is new.
    pub fn insert(
        &self,
        type_handle: Address,
        token: DispatchToken,
        target: Address,
    ) -> Result<(Address, bool), Fault> {
        let _writer = self.writer.lock();
        let bucket = self.bucket_for(type_handle, token);
        let head = self.memory.load_word(bucket)?;

        let mut cursor = head;
        while cursor != 0 {
            let at = Address(cursor);
            if self.memory.load_word(at.offset(element::TYPE as i64))? == type_handle.as_u64()
                && self.memory.load_word(at.offset(element::TOKEN as i64))? == token.0
            {
                return Ok((at, false));
            }
            cursor = self.memory.load_word(at.offset(element::NEXT as i64))?;
        }

        let fresh = self.memory.allocate_data(element::SIZE, 32)?;
        self.memory
            .store_word(fresh.offset(element::TYPE as i64), type_handle.as_u64())?;
        self.memory
            .store_word(fresh.offset(element::TOKEN as i64), token.0)?;
        self.memory
            .store_word(fresh.offset(element::TARGET as i64), target.as_u64())?;
        self.memory
            .store_word(fresh.offset(element::NEXT as i64), head)?;
        // Publication point.
        self.memory.store_word(bucket, fresh.as_u64())?;

        self.entries.fetch_add(1, Ordering::Relaxed);
        trace!(%type_handle, %token, %target, element = %fresh, "published resolve cache element");
        Ok((fresh, true))
    }

    /// Forget every entry. Chains already being walked stay intact.
    pub fn clear(&self) -> Result<(), Fault> {
        let _writer = self.writer.lock();
        for i in 0..self.bucket_count() {
            self.memory.store_word(self.buckets + i * WORD_SIZE, 0)?;
        }
        self.entries.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLayout;

    fn cache(bits: u32) -> (Arc<AddressSpace>, ResolveCache) {
        let memory = AddressSpace::new(MemoryLayout::default());
        let cache = ResolveCache::new(memory.clone(), bits).unwrap();
        (memory, cache)
    }

    #[test]
    fn test_bucket_bits_out_of_range_are_rejected() {
        let memory = AddressSpace::new(MemoryLayout::default());
        for bits in [0, MAX_CACHE_BITS + 1, 64] {
            assert_eq!(
                ResolveCache::new(memory.clone(), bits).err(),
                Some(DispatchError::InvalidCacheSize { bits })
            );
        }
        let (_, smallest) = cache(1);
        assert_eq!(smallest.bucket_count(), 2);
        assert!(smallest.hash_token(DispatchToken(u64::MAX)) <= smallest.scaled_mask());
    }

    #[test]
    fn test_empty_chain_falls_through() {
        let (_, cache) = cache(4);
        let probe = cache.lookup(Address(0x1000_4000), DispatchToken(3)).unwrap();
        assert_eq!(
            probe,
            Probe {
                target: None,
                comparisons: 0
            }
        );
    }

    #[test]
    fn test_chain_position_determines_comparisons() {
        let (_, cache) = cache(1);
        let token = DispatchToken(9);
        let hashed = cache.hash_token(token);
        let wanted = cache.bucket_offset(Address(0x1000_0000), hashed);
        let chain: Vec<Address> = (0..256u64)
            .map(|i| Address(0x1000_0000 + i * 0x20))
            .filter(|&t| cache.bucket_offset(t, hashed) == wanted)
            .take(4)
            .collect();
        assert_eq!(chain.len(), 4);

        for (i, ty) in chain.iter().enumerate() {
            cache
                .insert(*ty, token, Address(0x7f00_1000 + i as u64 * 16))
                .unwrap();
        }
        // Newest first.
        for (position, ty) in chain.iter().rev().enumerate() {
            let probe = cache.lookup(*ty, token).unwrap();
            assert_eq!(probe.comparisons, position + 1);
            assert!(probe.target.is_some());
        }
        assert_eq!(cache.chain_len(chain[0], token).unwrap(), 4);

        // A miss walks the whole chain.
        let absent = cache.lookup(chain[0], DispatchToken(10)).unwrap();
        assert!(absent.target.is_none());
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let (_, cache) = cache(6);
        let ty = Address(0x1000_0040);
        let (first, new) = cache.insert(ty, DispatchToken(1), Address(0x7f00_0010)).unwrap();
        assert!(new);
        let (again, new) = cache.insert(ty, DispatchToken(1), Address(0x7f00_0020)).unwrap();
        assert!(!new);
        assert_eq!(first, again);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.lookup(ty, DispatchToken(1)).unwrap().target,
            Some(Address(0x7f00_0010))
        );
    }

    #[test]
    fn test_clear_keeps_published_elements_readable() {
        let (memory, cache) = cache(6);
        let ty = Address(0x1000_0080);
        let (published, _) = cache.insert(ty, DispatchToken(2), Address(0x7f00_0030)).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.lookup(ty, DispatchToken(2)).unwrap().target, None);
        assert!(cache.is_empty());
        assert_eq!(
            memory
                .load_word(published.offset(element::TARGET as i64))
                .unwrap(),
            0x7f00_0030
        );
    }
}
