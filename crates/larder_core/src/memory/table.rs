//! # Fixed Memory Table
//!
//! Size-class routing over a row of pools.
//!
//! ```text
//!   alignment = 16, small_size = 128  →  8 size classes
//!
//!   size    1..=16   17..=32   33..=48   ...   113..=128   129..
//!   pool      0         1         2      ...       7       backing arena
//! ```

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::config::{BackingKind, LockKind, TableConfig};
use crate::error::{ArenaError, ArenaResult};
use crate::memory::arena::{AllocRequest, Alignment, Arena, ArenaIdentity};
use crate::memory::fixed::{check_key, PoolLock};
use crate::memory::pool::{FixedSizePool, PoolKey, PoolStats};
use crate::sync::SharedLock;

/// The full configuration of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableKey {
    /// Size-class granularity and block alignment.
    pub alignment: Alignment,
    /// Alignment displacement.
    pub offset: usize,
    /// Bytes per chunk in every size-class pool.
    pub chunk_size: usize,
    /// Largest size served from a pool.
    pub small_size: usize,
    /// Where chunks and oversized requests come from.
    pub backing: BackingKind,
    /// How the pools are locked.
    pub lock: LockKind,
}

impl TableKey {
    /// Number of size-class pools.
    #[must_use]
    pub const fn pool_count(&self) -> usize {
        if self.alignment.get() < self.small_size {
            self.small_size / self.alignment.get()
        } else {
            1
        }
    }

    /// Size class serving `size`, or `None` for zero and oversized requests.
    #[must_use]
    pub const fn pool_index(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let index = (size - 1) / self.alignment.get();
        if index < self.pool_count() {
            Some(index)
        } else {
            None
        }
    }

    /// Key of the pool for size class `index`.
    #[must_use]
    pub const fn pool_key(&self, index: usize) -> PoolKey {
        PoolKey {
            max_size: self.alignment.get() * (index + 1),
            alignment: self.alignment,
            offset: self.offset,
            chunk_size: self.chunk_size,
            backing: self.backing,
            lock: self.lock,
        }
    }

    /// Checks that every size-class pool is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] for a zero `small_size` or a
    /// chunk too small for the largest size class.
    pub fn validate(&self) -> ArenaResult<()> {
        if self.small_size == 0 {
            return Err(ArenaError::InvalidConfig(
                "table small_size must be greater than zero".to_string(),
            ));
        }
        self.pool_key(self.pool_count() - 1).validate()
    }
}

/// Routes requests to size-class pools, and larger ones to the backing
/// arena.
///
/// Size-class pools are the same shared pools a [`crate::memory::FixedArena`]
/// with the matching key would use.
pub struct FixedMemoryTable<L: PoolLock = SharedLock> {
    key: TableKey,
    owner: Option<ThreadId>,
    pools: Vec<L::Handle>,
    backing: Arc<dyn Arena + Send + Sync>,
}

impl<L: PoolLock> FixedMemoryTable<L> {
    /// Builds a table from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the settings are unusable, or a
    /// lifecycle error if the pool registry is gone.
    pub fn new(config: &TableConfig) -> ArenaResult<Self> {
        Self::from_key(config.key()?)
    }

    /// Builds a table for an explicit key, resolving every size-class pool.
    ///
    /// # Errors
    ///
    /// As [`FixedMemoryTable::new`].
    pub fn from_key(key: TableKey) -> ArenaResult<Self> {
        key.validate()?;
        let pools = (0..key.pool_count())
            .map(|index| {
                let pool_key = key.pool_key(index);
                check_key::<L>(&pool_key)?;
                L::resolve(pool_key)
            })
            .collect::<ArenaResult<Vec<_>>>()?;
        tracing::debug!(
            pools = pools.len(),
            alignment = key.alignment.get(),
            small_size = key.small_size,
            "size-class table ready"
        );
        Ok(Self {
            key,
            owner: L::owner(),
            pools,
            backing: key.backing.arena(),
        })
    }

    /// The table's key.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> &TableKey {
        &self.key
    }

    /// Number of size-class pools.
    #[inline]
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Size class serving `size`; see [`TableKey::pool_index`].
    #[inline]
    #[must_use]
    pub const fn pool_index(&self, size: usize) -> Option<usize> {
        self.key.pool_index(size)
    }

    /// The pool for size class `index`.
    #[must_use]
    pub fn pool(&self, index: usize) -> Option<&FixedSizePool<L>> {
        self.pools.get(index).map(|handle| &**handle)
    }

    /// Counters of every size-class pool, smallest class first.
    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|pool| pool.stats()).collect()
    }

    fn accepts(&self, request: &AllocRequest<'_>) -> bool {
        request.offset == self.key.offset && request.alignment <= self.key.alignment
    }

    fn pool_owning(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.pools.iter().position(|pool| pool.owns(ptr))
    }
}

impl<L: PoolLock> Arena for FixedMemoryTable<L> {
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        if request.size == 0 || !self.accepts(&request) {
            return None;
        }
        match self.pool_index(request.size) {
            Some(index) => self.pools[index].allocate(request.name),
            None => self.backing.allocate(
                AllocRequest::new(request.size)
                    .with_alignment(self.key.alignment)
                    .with_offset(self.key.offset)
                    .with_name(request.name),
            ),
        }
    }

    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        match (ptr, size) {
            (Some(_), 0) => Err(ArenaError::ContractViolation(
                "non-null pointer released with size 0",
            )),
            (None, _) => Ok(()),
            (Some(ptr), size) => match self.pool_index(size) {
                Some(index) => {
                    if cfg!(debug_assertions) && !self.pools[index].owns(ptr) {
                        return Err(ArenaError::ContractViolation(
                            "released size names a size class that does not own the block",
                        ));
                    }
                    // SAFETY: the caller returns a block of this size class.
                    unsafe { self.pools[index].deallocate(ptr) };
                    Ok(())
                }
                None => {
                    // Pool slots carry no backing block header.
                    if let Some(index) = self.pool_owning(ptr) {
                        tracing::warn!(size, class = index, "pool slot released with an oversized size");
                        return Err(ArenaError::ContractViolation(
                            "pool slot released with a size above small_size",
                        ));
                    }
                    // SAFETY: oversized blocks came from the backing arena.
                    unsafe { self.backing.deallocate(Some(ptr), size) }
                }
            },
        }
    }

    #[inline]
    fn max_size(&self) -> usize {
        self.backing.max_size()
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        match self.owner {
            None => ArenaIdentity::Table(self.key),
            Some(thread) => ArenaIdentity::LocalTable {
                key: self.key,
                thread,
            },
        }
    }
}

impl<L: PoolLock> fmt::Debug for FixedMemoryTable<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedMemoryTable")
            .field("key", &self.key)
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::LocalLock;

    fn table(alignment: usize, small_size: usize) -> TableConfig {
        TableConfig {
            alignment,
            small_size,
            chunk_size: 2048,
            ..TableConfig::default()
        }
    }

    #[test]
    fn test_pool_index_sixteen_by_eight() {
        let key = table(16, 128).key().unwrap();
        assert_eq!(key.pool_count(), 8);
        assert_eq!(key.pool_index(0), None);
        for size in 1..=128 {
            assert_eq!(key.pool_index(size), Some((size - 1) / 16));
        }
        assert_eq!(key.pool_index(129), None);
    }

    #[test]
    fn test_single_pool_when_alignment_reaches_small_size() {
        let key = table(64, 64).key().unwrap();
        assert_eq!(key.pool_count(), 1);
        assert_eq!(key.pool_index(64), Some(0));
        assert_eq!(key.pool_index(65), None);
    }

    #[test]
    fn test_routing() {
        let table: FixedMemoryTable = FixedMemoryTable::new(&table(16, 128)).unwrap();
        assert_eq!(table.pool_count(), 8);

        let small = table.allocate(AllocRequest::new(20)).unwrap();
        assert!(table.pool(1).unwrap().owns(small));
        assert_eq!(small.as_ptr() as usize % 16, 0);

        let large = table.allocate(AllocRequest::new(500)).unwrap();
        assert_eq!(large.as_ptr() as usize % 16, 0);
        assert!(table.pools.iter().all(|pool| !pool.owns(large)));

        unsafe {
            table.deallocate(Some(small), 20).unwrap();
            table.deallocate(Some(large), 500).unwrap();
        }
    }

    #[test]
    fn test_zero_size_contract() {
        let table: FixedMemoryTable = FixedMemoryTable::new(&table(8, 64)).unwrap();
        assert!(table.allocate(AllocRequest::new(0)).is_none());
        assert_eq!(unsafe { table.deallocate(None, 0) }, Ok(()));

        let ptr = table.allocate(AllocRequest::new(8)).unwrap();
        assert!(matches!(
            unsafe { table.deallocate(Some(ptr), 0) },
            Err(ArenaError::ContractViolation(_))
        ));
        unsafe { table.deallocate(Some(ptr), 8).unwrap() };
    }

    #[test]
    fn test_rejects_foreign_offset_and_alignment() {
        let table: FixedMemoryTable = FixedMemoryTable::new(&table(8, 64)).unwrap();
        assert!(table.allocate(AllocRequest::new(8).with_offset(4)).is_none());
        assert!(table
            .allocate(AllocRequest::new(8).with_alignment(Alignment::new(32).unwrap()))
            .is_none());
    }

    #[test]
    fn test_shares_pools_with_fixed_arenas() {
        use crate::memory::FixedArena;

        let key = table(16, 64).key().unwrap();
        let table: FixedMemoryTable = FixedMemoryTable::from_key(key).unwrap();
        let arena: FixedArena = FixedArena::from_key(key.pool_key(2)).unwrap();
        assert!(std::ptr::eq(table.pool(2).unwrap(), arena.pool().unwrap()));
    }

    #[test]
    fn test_local_table() {
        let mut config = table(16, 64);
        config.lock = LockKind::Local;
        let table = FixedMemoryTable::<LocalLock>::new(&config).unwrap();
        let ptr = table.allocate(AllocRequest::new(40)).unwrap();
        unsafe { table.deallocate(Some(ptr), 40).unwrap() };
        assert_eq!(table.stats()[2].in_use, 0);
    }

    #[test]
    fn test_local_tables_are_bound_to_their_thread() {
        let mut config = table(16, 64);
        config.lock = LockKind::Local;
        let here = FixedMemoryTable::<LocalLock>::new(&config).unwrap();
        let there = std::thread::spawn(move || {
            FixedMemoryTable::<LocalLock>::new(&config).unwrap().identity()
        })
        .join()
        .unwrap();
        assert_ne!(here.identity(), there);

        let shared: FixedMemoryTable = FixedMemoryTable::new(&table(16, 64)).unwrap();
        assert_eq!(shared.identity(), ArenaIdentity::Table(*shared.key()));
    }

    #[test]
    fn test_slot_released_with_oversized_size() {
        let table: FixedMemoryTable = FixedMemoryTable::new(&table(16, 128)).unwrap();
        let ptr = table.allocate(AllocRequest::new(20)).unwrap();
        assert!(matches!(
            unsafe { table.deallocate(Some(ptr), 500) },
            Err(ArenaError::ContractViolation(_))
        ));
        assert!(table.pool(1).unwrap().owns(ptr));
        unsafe { table.deallocate(Some(ptr), 20).unwrap() };
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_large_block_released_with_small_size() {
        let table: FixedMemoryTable = FixedMemoryTable::new(&table(16, 128)).unwrap();
        let ptr = table.allocate(AllocRequest::new(500)).unwrap();
        assert!(matches!(
            unsafe { table.deallocate(Some(ptr), 20) },
            Err(ArenaError::ContractViolation(_))
        ));
        unsafe { table.deallocate(Some(ptr), 500).unwrap() };
    }

    #[test]
    fn test_invalid_table() {
        let mut config = table(16, 128);
        config.chunk_size = 64;
        assert!(matches!(config.key(), Err(ArenaError::InvalidConfig(_))));
        config.small_size = 0;
        assert!(config.key().is_err());
    }
}
