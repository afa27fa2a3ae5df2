//! # Arena Contract
//!
//! The capability every memory source in this crate implements: aligned
//! allocation at an offset, sized deallocation, a maximum servable size and
//! an identity used for equality.
//!
//! ## Alignment at an offset
//!
//! ```text
//!   returned pointer A
//!   │
//!   ▼
//!   ┌────────────┬──────────────────────────┐
//!   │ offset     │ field that must be       │
//!   │ bytes      │ aligned                  │
//!   └────────────┴──────────────────────────┘
//!                ▲
//!                A + offset ≡ 0 (mod alignment)
//! ```

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::error::{ArenaError, ArenaResult};
use crate::memory::pool::PoolKey;
use crate::memory::table::TableKey;

/// A validated power-of-two alignment.
///
/// The only way to obtain one is through a checked constructor, so a zero or
/// non-power-of-two alignment never reaches an allocation call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Alignment(usize);

impl Alignment {
    /// Machine word alignment, the default for every request.
    pub const WORD: Self = Self(mem::size_of::<usize>());

    /// Byte alignment (no constraint).
    pub const BYTE: Self = Self(1);

    /// Validates `bytes` as an alignment.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidAlignment`] if `bytes` is zero or not a
    /// power of two.
    pub fn new(bytes: usize) -> ArenaResult<Self> {
        if bytes.is_power_of_two() {
            Ok(Self(bytes))
        } else {
            Err(ArenaError::InvalidAlignment { alignment: bytes })
        }
    }

    /// The alignment of `T`.
    #[inline]
    #[must_use]
    pub const fn of<T>() -> Self {
        Self(mem::align_of::<T>())
    }

    /// The alignment of a [`Layout`].
    #[inline]
    #[must_use]
    pub const fn from_layout(layout: Layout) -> Self {
        Self(layout.align())
    }

    /// Alignment in bytes.
    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// `alignment - 1`.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> usize {
        self.0 - 1
    }

    /// Whether `value` is a multiple of this alignment.
    #[inline]
    #[must_use]
    pub const fn divides(self, value: usize) -> bool {
        value & self.mask() == 0
    }

    /// Rounds `value` up to the next multiple, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn round_up(self, value: usize) -> Option<usize> {
        match value.checked_add(self.mask()) {
            Some(bumped) => Some(bumped & !self.mask()),
            None => None,
        }
    }

    /// Whether `addr + offset` lands on this alignment.
    #[inline]
    #[must_use]
    pub const fn is_aligned_at(self, addr: usize, offset: usize) -> bool {
        self.divides(addr.wrapping_add(offset))
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self::WORD
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One allocation request.
///
/// # Example
///
/// ```rust,ignore
/// let request = AllocRequest::new(48)
///     .with_alignment(Alignment::new(16)?)
///     .with_offset(8)
///     .named("particles");
/// let ptr = arena.allocate(request);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest<'a> {
    /// Requested size in bytes.
    pub size: usize,
    /// Alignment that must hold at `offset` bytes into the block.
    pub alignment: Alignment,
    /// Displacement at which the alignment is evaluated.
    pub offset: usize,
    /// Diagnostic label, only ever used in trace events.
    pub name: Option<&'a str>,
}

impl<'a> AllocRequest<'a> {
    /// A word-aligned request for `size` bytes at offset zero.
    #[inline]
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            alignment: Alignment::WORD,
            offset: 0,
            name: None,
        }
    }

    /// A request sized and aligned for `count` values of `T`.
    ///
    /// Returns `None` if the byte size overflows.
    #[must_use]
    pub fn array<T>(count: usize) -> Option<Self> {
        let size = count.checked_mul(mem::size_of::<T>())?;
        Some(Self::new(size).with_alignment(Alignment::of::<T>()))
    }

    /// Replaces the alignment.
    #[inline]
    #[must_use]
    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Replaces the offset.
    #[inline]
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Attaches a diagnostic label.
    #[inline]
    #[must_use]
    pub fn named(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Copies over the label of another request, if any.
    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: Option<&'a str>) -> Self {
        self.name = name;
        self
    }
}

/// What an arena *is*, for the purpose of equality.
///
/// Two arenas with equal identities can release each other's memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArenaIdentity {
    /// The native heap. Every heap arena is interchangeable.
    Heap,
    /// The global hooks (heap plus exhaustion handler).
    Global,
    /// The shared pool keyed by this configuration.
    Pool(PoolKey),
    /// The size-class table keyed by this configuration.
    Table(TableKey),
    /// A thread-local pool: only equal on the thread that owns it.
    LocalPool {
        /// Pool configuration.
        key: PoolKey,
        /// Thread whose pool registry holds the pool.
        thread: ThreadId,
    },
    /// A table over thread-local pools.
    LocalTable {
        /// Table configuration.
        key: TableKey,
        /// Thread whose pool registry holds the pools.
        thread: ThreadId,
    },
    /// An embedder-provided arena, identified by its address.
    Instance(usize),
}

impl ArenaIdentity {
    /// Identity of a specific arena instance.
    #[inline]
    #[must_use]
    pub fn of_instance<A: ?Sized>(arena: &A) -> Self {
        Self::Instance((arena as *const A).cast::<()>() as usize)
    }
}

/// A source of raw, aligned memory.
///
/// Implementations must guarantee that a pointer `p` returned for a request
/// satisfies `(p + request.offset) % request.alignment == 0` and that at
/// least `request.size` bytes are usable from `p`.
pub trait Arena {
    /// Allocates memory for `request`.
    ///
    /// Returns `None` when `request.size` is zero, when the request can't be
    /// served by this arena, or when memory is exhausted.
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>>;

    /// Releases memory previously returned by [`Arena::allocate`].
    ///
    /// `None` with any size is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a contract violation when `size` can't belong to a block of
    /// this arena, or differs from the size used at allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this arena (or one equal to it),
    /// must not have been released already, and `size` must be the size
    /// that was requested.
    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()>;

    /// The largest size this arena can serve.
    fn max_size(&self) -> usize;

    /// The arena's identity.
    fn identity(&self) -> ArenaIdentity;
}

/// Whether two arenas are equal: the same instance, or equal identities.
#[must_use]
pub fn same_arena<A, B>(left: &A, right: &B) -> bool
where
    A: Arena + ?Sized,
    B: Arena + ?Sized,
{
    let same_instance = std::ptr::eq(
        (left as *const A).cast::<()>(),
        (right as *const B).cast::<()>(),
    );
    same_instance || left.identity() == right.identity()
}

impl<A: Arena + ?Sized> Arena for &A {
    #[inline]
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        (**self).allocate(request)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        // SAFETY: forwarded contract.
        unsafe { (**self).deallocate(ptr, size) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        (**self).max_size()
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        (**self).identity()
    }
}

impl<A: Arena + ?Sized> Arena for Arc<A> {
    #[inline]
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        (**self).allocate(request)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        // SAFETY: forwarded contract.
        unsafe { (**self).deallocate(ptr, size) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        (**self).max_size()
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        (**self).identity()
    }
}

impl<A: Arena + ?Sized> Arena for Box<A> {
    #[inline]
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        (**self).allocate(request)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        // SAFETY: forwarded contract.
        unsafe { (**self).deallocate(ptr, size) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        (**self).max_size()
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        (**self).identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_rejects_zero_and_non_powers() {
        assert_eq!(
            Alignment::new(0),
            Err(ArenaError::InvalidAlignment { alignment: 0 })
        );
        assert!(Alignment::new(3).is_err());
        assert!(Alignment::new(24).is_err());
        assert_eq!(Alignment::new(64).map(Alignment::get), Ok(64));
    }

    #[test]
    fn test_alignment_round_up() {
        let sixteen = Alignment::new(16).unwrap();
        assert_eq!(sixteen.round_up(0), Some(0));
        assert_eq!(sixteen.round_up(1), Some(16));
        assert_eq!(sixteen.round_up(32), Some(32));
        assert_eq!(sixteen.round_up(usize::MAX), None);
    }

    #[test]
    fn test_aligned_at_offset() {
        let eight = Alignment::new(8).unwrap();
        assert!(eight.is_aligned_at(0x1004, 4));
        assert!(!eight.is_aligned_at(0x1004, 0));
        assert!(eight.is_aligned_at(0x1000, 16));
    }

    #[test]
    fn test_request_builder() {
        let request = AllocRequest::new(40)
            .with_alignment(Alignment::new(32).unwrap())
            .with_offset(8)
            .named("mesh");
        assert_eq!(request.size, 40);
        assert_eq!(request.alignment.get(), 32);
        assert_eq!(request.offset, 8);
        assert_eq!(request.name, Some("mesh"));

        assert!(AllocRequest::array::<u64>(usize::MAX).is_none());
        let array = AllocRequest::array::<u32>(10).unwrap();
        assert_eq!(array.size, 40);
        assert_eq!(array.alignment, Alignment::of::<u32>());
    }
}
