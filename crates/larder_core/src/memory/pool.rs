//! # Fixed-Size Pool
//!
//! Slot allocator for requests that all fit one configured size.
//!
//! ## Chunk Layout
//!
//! ```text
//!   chunk (from the backing arena)
//!   ┌──────────────┬────────┬────────┬────────┬─────┬───────┐
//!   │ ChunkHeader  │ slot 0 │ slot 1 │ slot 2 │ ... │ slack │
//!   │ next │ slots │        │        │        │     │       │
//!   └──────────────┴────────┴────────┴────────┴─────┴───────┘
//!                  ▲
//!                  slot + offset ≡ 0 (mod alignment)
//! ```
//!
//! Chunks form a singly linked list through their headers. Free slots form
//! a second list threaded through the slots themselves (see `free_list`).
//! Pools grow one chunk at a time and never shrink; chunks go back to the
//! backing arena when the pool is dropped.

#![allow(unsafe_code)]

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::lock_api::{Mutex, RawMutex};

use crate::config::{BackingKind, LockKind, DEFAULT_CHUNK_SIZE};
use crate::error::{ArenaError, ArenaResult};
use crate::memory::arena::{AllocRequest, Alignment, Arena};
use crate::memory::free_list::FreeList;
use crate::sync::SharedLock;

/// Header at the start of every chunk.
#[derive(Clone, Copy)]
#[repr(C)]
struct ChunkHeader {
    next: Option<NonNull<u8>>,
    slots: usize,
}

/// Bytes reserved at the start of every chunk.
pub const CHUNK_HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();

/// The full configuration of a pool.
///
/// Pools are shared by key: every fixed arena and table built from an
/// equal key draws from the same pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Largest request a slot holds.
    pub max_size: usize,
    /// Alignment of every slot, evaluated at `offset`.
    pub alignment: Alignment,
    /// Alignment displacement.
    pub offset: usize,
    /// Bytes requested from the backing arena per chunk.
    pub chunk_size: usize,
    /// Where chunks come from.
    pub backing: BackingKind,
    /// How the pool is locked.
    pub lock: LockKind,
}

impl PoolKey {
    /// A heap-backed, mutex-guarded key with offset zero and the default
    /// chunk size.
    #[must_use]
    pub const fn new(max_size: usize, alignment: Alignment) -> Self {
        Self {
            max_size,
            alignment,
            offset: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backing: BackingKind::Heap,
            lock: LockKind::Mutex,
        }
    }

    /// Replaces the offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Replaces the chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Replaces the backing arena kind.
    #[must_use]
    pub const fn with_backing(mut self, backing: BackingKind) -> Self {
        self.backing = backing;
        self
    }

    /// Replaces the lock kind.
    #[must_use]
    pub const fn with_lock(mut self, lock: LockKind) -> Self {
        self.lock = lock;
        self
    }

    /// Slot size: `max_size` (at least one pointer) rounded up to the
    /// alignment.
    #[must_use]
    pub fn slot_size(&self) -> Option<usize> {
        self.alignment
            .round_up(self.max_size.max(mem::size_of::<usize>()))
    }

    /// Number of slots carved from each chunk.
    #[must_use]
    pub fn slots_per_chunk(&self) -> usize {
        match (self.slot_size(), self.chunk_size.checked_sub(CHUNK_HEADER_SIZE)) {
            (Some(slot), Some(usable)) if slot > 0 => usable / slot,
            _ => 0,
        }
    }

    /// Checks that the key describes a usable pool.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] for a zero `max_size` or a
    /// chunk too small to hold the header and one slot.
    pub fn validate(&self) -> ArenaResult<()> {
        if self.max_size == 0 {
            return Err(ArenaError::InvalidConfig(
                "pool max_size must be greater than zero".to_string(),
            ));
        }
        if self.slots_per_chunk() == 0 {
            return Err(ArenaError::InvalidConfig(format!(
                "chunk_size {} cannot hold a {}-byte header and one {}-byte slot",
                self.chunk_size,
                CHUNK_HEADER_SIZE,
                self.slot_size().unwrap_or(usize::MAX),
            )));
        }
        Ok(())
    }
}

/// A snapshot of a pool's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes per slot.
    pub slot_size: usize,
    /// Slots carved from each chunk.
    pub slots_per_chunk: usize,
    /// Chunks obtained so far.
    pub chunks: usize,
    /// Slots handed out and not yet returned.
    pub in_use: usize,
    /// Slots on the free list.
    pub free: usize,
    /// Highest `in_use` ever observed.
    pub peak_in_use: usize,
}

impl PoolStats {
    /// Total slot capacity across all chunks.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.chunks * self.slots_per_chunk
    }
}

struct PoolState {
    free: FreeList,
    chunks: Option<NonNull<u8>>,
    chunk_count: usize,
    in_use: usize,
    peak_in_use: usize,
}

// SAFETY: the chunk pointers are owned by the pool; the state is only ever
// touched under the pool lock.
unsafe impl Send for PoolState {}

impl PoolState {
    #[inline]
    fn checked_out(&mut self, slot: NonNull<u8>) -> NonNull<u8> {
        self.in_use += 1;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
        slot
    }
}

/// A pool of equally sized slots carved from chunks of a backing arena.
///
/// The lock type decides who may touch the pool: [`SharedLock`] for any
/// thread, [`crate::sync::LocalLock`] for the constructing thread only.
///
/// # Example
///
/// ```rust,ignore
/// let key = PoolKey::new(64, Alignment::new(8)?).with_chunk_size(4096);
/// let pool: FixedSizePool = FixedSizePool::new(key)?;
///
/// let slot = pool.allocate(Some("particles")).expect("backing exhausted");
/// unsafe { pool.deallocate(slot) };
/// assert_eq!(pool.stats().chunks, 1);
/// ```
pub struct FixedSizePool<L: RawMutex = SharedLock> {
    key: PoolKey,
    slot_size: usize,
    slots_per_chunk: usize,
    backing: Arc<dyn Arena + Send + Sync>,
    state: Mutex<L, PoolState>,
}

impl<L: RawMutex> FixedSizePool<L> {
    /// Creates an empty pool drawing chunks from the key's backing arena.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] if the key is unusable.
    pub fn new(key: PoolKey) -> ArenaResult<Self> {
        Self::with_backing(key, key.backing.arena())
    }

    /// Creates an empty pool drawing chunks from `backing`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] if the key is unusable.
    pub fn with_backing(key: PoolKey, backing: Arc<dyn Arena + Send + Sync>) -> ArenaResult<Self> {
        key.validate()?;
        let slot_size = key
            .slot_size()
            .ok_or_else(|| ArenaError::InvalidConfig("slot size overflows".to_string()))?;
        Ok(Self {
            key,
            slot_size,
            slots_per_chunk: key.slots_per_chunk(),
            backing,
            state: Mutex::new(PoolState {
                free: FreeList::new(slot_size),
                chunks: None,
                chunk_count: 0,
                in_use: 0,
                peak_in_use: 0,
            }),
        })
    }

    /// The pool's configuration.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Bytes per slot.
    #[inline]
    #[must_use]
    pub const fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots carved from each chunk.
    #[inline]
    #[must_use]
    pub const fn slots_per_chunk(&self) -> usize {
        self.slots_per_chunk
    }

    /// Hands out one slot, growing by a chunk if the free list is empty.
    ///
    /// Returns `None` only if the backing arena can't supply a chunk.
    pub fn allocate(&self, name: Option<&str>) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        if let Some(slot) = state.free.pop() {
            return Some(state.checked_out(slot));
        }

        self.grow(&mut state, name)?;
        let slot = state.free.pop()?;
        Some(state.checked_out(slot))
    }

    /// Returns a slot to the free list.
    ///
    /// # Safety
    ///
    /// `slot` must have been handed out by this pool and not returned since.
    ///
    /// # Panics
    ///
    /// Debug builds assert that `slot` belongs to this pool and is not
    /// already free.
    pub unsafe fn deallocate(&self, slot: NonNull<u8>) {
        let mut state = self.state.lock();
        debug_assert!(
            self.owns_locked(&state, slot),
            "pointer {slot:p} does not belong to this pool"
        );
        debug_assert!(!state.free.contains(slot), "double free of slot {slot:p}");

        // SAFETY: the caller returns a slot of this pool that it no longer
        // uses.
        unsafe { state.free.push(slot) };
        state.in_use = state.in_use.saturating_sub(1);
    }

    /// Whether `ptr` is the start of one of this pool's slots.
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let state = self.state.lock();
        self.owns_locked(&state, ptr)
    }

    /// A snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            slot_size: self.slot_size,
            slots_per_chunk: self.slots_per_chunk,
            chunks: state.chunk_count,
            in_use: state.in_use,
            free: state.free.len(),
            peak_in_use: state.peak_in_use,
        }
    }

    fn grow(&self, state: &mut PoolState, name: Option<&str>) -> Option<()> {
        let request = AllocRequest::new(self.key.chunk_size)
            .with_alignment(self.key.alignment)
            .with_offset(self.key.offset.wrapping_add(CHUNK_HEADER_SIZE))
            .with_name(name);
        let Some(chunk) = self.backing.allocate(request) else {
            tracing::warn!(
                chunk_size = self.key.chunk_size,
                chunks = state.chunk_count,
                name,
                "pool backing arena exhausted"
            );
            return None;
        };

        // SAFETY: the chunk is `chunk_size` bytes, enough for the header and
        // `slots_per_chunk` slots (checked by `PoolKey::validate`).
        unsafe {
            ptr::write_unaligned(
                chunk.as_ptr().cast::<ChunkHeader>(),
                ChunkHeader {
                    next: state.chunks,
                    slots: self.slots_per_chunk,
                },
            );
            let first = chunk.as_ptr().add(CHUNK_HEADER_SIZE);
            // Reverse so the lowest address is handed out first.
            for index in (0..self.slots_per_chunk).rev() {
                state
                    .free
                    .push(NonNull::new_unchecked(first.add(index * self.slot_size)));
            }
        }
        state.chunks = Some(chunk);
        state.chunk_count += 1;

        tracing::debug!(
            chunks = state.chunk_count,
            slot_size = self.slot_size,
            slots_per_chunk = self.slots_per_chunk,
            name,
            "pool grew"
        );
        Some(())
    }

    fn owns_locked(&self, state: &PoolState, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let mut cursor = state.chunks;
        while let Some(chunk) = cursor {
            // SAFETY: every chunk on the list starts with a header.
            let header = unsafe { ptr::read_unaligned(chunk.as_ptr().cast::<ChunkHeader>()) };
            let first = chunk.as_ptr() as usize + CHUNK_HEADER_SIZE;
            let end = first + header.slots * self.slot_size;
            if (first..end).contains(&addr) {
                return (addr - first) % self.slot_size == 0;
            }
            cursor = header.next;
        }
        false
    }
}

impl<L: RawMutex> Drop for FixedSizePool<L> {
    fn drop(&mut self) {
        let chunk_size = self.key.chunk_size;
        let state = self.state.get_mut();
        if state.in_use > 0 {
            tracing::warn!(
                in_use = state.in_use,
                slot_size = self.slot_size,
                "pool dropped with live slots"
            );
        }

        let mut cursor = state.chunks.take();
        while let Some(chunk) = cursor {
            // SAFETY: every chunk on the list starts with a header and came
            // from `backing` with `chunk_size` bytes.
            unsafe {
                cursor = ptr::read_unaligned(chunk.as_ptr().cast::<ChunkHeader>()).next;
                if let Err(err) = self.backing.deallocate(Some(chunk), chunk_size) {
                    tracing::warn!(error = %err, "failed to return chunk to backing arena");
                }
            }
        }
    }
}

impl<L: RawMutex> fmt::Debug for FixedSizePool<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizePool")
            .field("key", &self.key)
            .field("slot_size", &self.slot_size)
            .field("slots_per_chunk", &self.slots_per_chunk)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::LocalLock;

    fn key(max_size: usize, align: usize, chunk_size: usize) -> PoolKey {
        PoolKey::new(max_size, Alignment::new(align).unwrap()).with_chunk_size(chunk_size)
    }

    #[test]
    fn test_geometry() {
        let key = key(32, 8, 256);
        assert_eq!(key.slot_size(), Some(32));
        assert_eq!(key.slots_per_chunk(), (256 - CHUNK_HEADER_SIZE) / 32);

        // Slots are never smaller than a free-list link.
        assert_eq!(self::key(1, 1, 256).slot_size(), Some(mem::size_of::<usize>()));
        assert_eq!(self::key(17, 16, 256).slot_size(), Some(32));
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            FixedSizePool::<SharedLock>::new(key(0, 8, 256)),
            Err(ArenaError::InvalidConfig(_))
        ));
        assert!(matches!(
            FixedSizePool::<SharedLock>::new(key(64, 8, CHUNK_HEADER_SIZE + 32)),
            Err(ArenaError::InvalidConfig(_))
        ));
        assert!(FixedSizePool::<SharedLock>::new(key(64, 8, 4)).is_err());
    }

    #[test]
    fn test_reuse_without_growth() {
        let pool: FixedSizePool = FixedSizePool::new(key(48, 16, 1024)).unwrap();
        let first = pool.allocate(None).unwrap();
        unsafe { pool.deallocate(first) };
        let second = pool.allocate(None).unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.stats().chunks, 1);
        unsafe { pool.deallocate(second) };
    }

    #[test]
    fn test_growth_and_stats() {
        let pool: FixedSizePool = FixedSizePool::new(key(32, 8, 256)).unwrap();
        let per_chunk = pool.slots_per_chunk();
        let slots: Vec<_> = (0..per_chunk + 1).map(|_| pool.allocate(None).unwrap()).collect();

        let stats = pool.stats();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.in_use, per_chunk + 1);
        assert_eq!(stats.free, per_chunk - 1);
        assert_eq!(stats.capacity(), 2 * per_chunk);

        for slot in &slots {
            assert!(pool.owns(*slot));
            assert_eq!(slot.as_ptr() as usize % 8, 0);
            unsafe { pool.deallocate(*slot) };
        }
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.peak_in_use, per_chunk + 1);
        assert_eq!(stats.free, 2 * per_chunk);
    }

    #[test]
    fn test_slots_honor_offset() {
        let pool: FixedSizePool = FixedSizePool::new(key(24, 32, 512).with_offset(8)).unwrap();
        for _ in 0..20 {
            let slot = pool.allocate(None).unwrap();
            assert_eq!((slot.as_ptr() as usize + 8) % 32, 0);
        }
    }

    #[test]
    fn test_foreign_pointer_not_owned() {
        let pool: FixedSizePool = FixedSizePool::new(key(16, 8, 256)).unwrap();
        let slot = pool.allocate(None).unwrap();
        let inside = NonNull::new(slot.as_ptr().wrapping_add(4)).unwrap();
        assert!(pool.owns(slot));
        assert!(!pool.owns(inside));
        unsafe { pool.deallocate(slot) };
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_caught() {
        let pool: FixedSizePool = FixedSizePool::new(key(16, 8, 256)).unwrap();
        let _keep = pool.allocate(None).unwrap();
        let slot = pool.allocate(None).unwrap();
        unsafe {
            pool.deallocate(slot);
            pool.deallocate(slot);
        }
    }

    #[test]
    fn test_local_pool() {
        let pool: FixedSizePool<LocalLock> =
            FixedSizePool::new(key(64, 8, 4096).with_lock(LockKind::Local)).unwrap();
        let slot = pool.allocate(Some("scratch")).unwrap();
        unsafe { pool.deallocate(slot) };
        assert_eq!(pool.stats().in_use, 0);
    }
}
