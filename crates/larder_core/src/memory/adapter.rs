//! # Arena Allocator Adapter
//!
//! Binds an element type, its alignment and an offset to one arena
//! reference. Adapters compare equal when their arenas do, so memory from
//! one can be released through any equal adapter, including one rebound to
//! another element type.
//!
//! The adapter also implements [`allocator_api2::alloc::Allocator`], which
//! lets `allocator_api2::vec::Vec` (and `hashbrown` collections) draw from
//! any arena on stable Rust.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator};

use crate::error::{ArenaError, ArenaResult};
use crate::memory::arena::{same_arena, AllocRequest, Alignment, Arena};

/// Allocates arrays of `T` from an arena.
///
/// # Example
///
/// ```rust,ignore
/// let heap = HeapArena::new();
/// let ints: ArenaAllocator<'_, u32, _> = ArenaAllocator::new(&heap);
/// let block = ints.allocate(16).expect("out of memory");
///
/// let bytes = ints.rebind::<u8>();
/// assert!(bytes == ints);
///
/// unsafe { ints.deallocate(block, 16)? };
/// ```
pub struct ArenaAllocator<'a, T, A: Arena + ?Sized> {
    arena: &'a A,
    offset: usize,
    name: Option<&'a str>,
    _element: PhantomData<fn() -> T>,
}

impl<'a, T, A: Arena + ?Sized> ArenaAllocator<'a, T, A> {
    /// An adapter over `arena` with offset zero.
    #[inline]
    #[must_use]
    pub const fn new(arena: &'a A) -> Self {
        Self {
            arena,
            offset: 0,
            name: None,
            _element: PhantomData,
        }
    }

    /// Evaluates the element alignment at `offset` bytes into each block.
    #[inline]
    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Labels every request made through this adapter.
    #[inline]
    #[must_use]
    pub const fn named(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// The referenced arena.
    #[inline]
    #[must_use]
    pub const fn arena(&self) -> &'a A {
        self.arena
    }

    /// The alignment offset.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Alignment of every block: that of `T`.
    #[inline]
    #[must_use]
    pub const fn alignment(&self) -> Alignment {
        Alignment::of::<T>()
    }

    /// Allocates room for `count` values of `T`.
    ///
    /// Returns `None` if the byte size overflows or the arena can't serve
    /// the request.
    #[must_use]
    pub fn allocate(&self, count: usize) -> Option<NonNull<T>> {
        let size = count.checked_mul(mem::size_of::<T>())?;
        let request = AllocRequest::new(size)
            .with_alignment(self.alignment())
            .with_offset(self.offset)
            .with_name(self.name);
        self.arena.allocate(request).map(NonNull::cast)
    }

    /// Releases room for `count` values of `T`.
    ///
    /// # Errors
    ///
    /// Returns the arena's contract violation, if any.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(count)` on this adapter or an equal
    /// one (rebinding to `T` first), and must not be released twice.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, count: usize) -> ArenaResult<()> {
        let size = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(ArenaError::ContractViolation("element count overflows"))?;
        // SAFETY: forwarded contract.
        unsafe { self.arena.deallocate(Some(ptr.cast()), size) }
    }

    /// The same arena, offset and label, for element type `U`.
    #[inline]
    #[must_use]
    pub const fn rebind<U>(&self) -> ArenaAllocator<'a, U, A> {
        ArenaAllocator {
            arena: self.arena,
            offset: self.offset,
            name: self.name,
            _element: PhantomData,
        }
    }

    /// Largest element count the arena could serve.
    #[must_use]
    pub fn max_size(&self) -> usize {
        match mem::size_of::<T>() {
            0 => usize::MAX,
            size => self.arena.max_size() / size,
        }
    }

    /// Validates assignment from `source`.
    ///
    /// The arena reference is never rebound; assignment between adapters
    /// over different arenas is refused.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::ArenaMismatch`] if the arenas differ.
    pub fn assign_from<U, B: Arena + ?Sized>(&mut self, source: &ArenaAllocator<'_, U, B>) -> ArenaResult<()> {
        if same_arena(self.arena, source.arena) {
            Ok(())
        } else {
            Err(ArenaError::ArenaMismatch)
        }
    }
}

impl<T, A: Arena + ?Sized> Clone for ArenaAllocator<'_, T, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A: Arena + ?Sized> Copy for ArenaAllocator<'_, T, A> {}

impl<T, U, A, B> PartialEq<ArenaAllocator<'_, U, B>> for ArenaAllocator<'_, T, A>
where
    A: Arena + ?Sized,
    B: Arena + ?Sized,
{
    fn eq(&self, other: &ArenaAllocator<'_, U, B>) -> bool {
        same_arena(self.arena, other.arena)
    }
}

impl<T, A: Arena + ?Sized> fmt::Debug for ArenaAllocator<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("element", &std::any::type_name::<T>())
            .field("arena", &self.arena.identity())
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

// SAFETY: blocks stay valid until released: the arena outlives `'a`, and
// every copy of the adapter refers to the same arena, so a block allocated
// through one copy can be released through another.
unsafe impl<T, A: Arena + ?Sized> Allocator for ArenaAllocator<'_, T, A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // Zero-sized blocks never touch the arena; any aligned address
            // will do.
            let dangling = NonNull::new(layout.align() as *mut u8).ok_or(AllocError)?;
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        let request = AllocRequest::new(layout.size())
            .with_alignment(Alignment::from_layout(layout))
            .with_name(self.name);
        let ptr = self.arena.allocate(request).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // SAFETY: `ptr` was allocated by an equal adapter with this layout.
        if let Err(err) = unsafe { self.arena.deallocate(Some(ptr), layout.size()) } {
            tracing::error!(error = %err, size = layout.size(), "container released a block incorrectly");
            debug_assert!(false, "container released a block incorrectly: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixedArenaConfig;
    use crate::memory::{ArenaIdentity, FixedArena, HeapArena};

    struct Scratch {
        limit: usize,
    }

    impl Scratch {
        const fn new() -> Self {
            Self { limit: 1 << 20 }
        }
    }

    impl Arena for Scratch {
        fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
            HeapArena.allocate(request)
        }

        unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
            unsafe { HeapArena.deallocate(ptr, size) }
        }

        fn max_size(&self) -> usize {
            self.limit
        }

        fn identity(&self) -> ArenaIdentity {
            ArenaIdentity::of_instance(self)
        }
    }

    #[repr(align(32))]
    struct Wide([u8; 48]);

    #[test]
    fn test_allocate_elements() {
        let heap = HeapArena::new();
        let wide: ArenaAllocator<'_, Wide, _> = ArenaAllocator::new(&heap);
        let block = wide.allocate(3).unwrap();
        assert_eq!(block.as_ptr() as usize % 32, 0);
        unsafe { wide.deallocate(block, 3).unwrap() };
        assert!(wide.allocate(usize::MAX).is_none());
    }

    #[test]
    fn test_offset_applies_to_element_alignment() {
        let heap = HeapArena::new();
        let ints: ArenaAllocator<'_, u64, _> = ArenaAllocator::new(&heap).with_offset(4);
        let block = ints.allocate(5).unwrap();
        assert_eq!((block.as_ptr() as usize + 4) % mem::align_of::<u64>(), 0);
        unsafe { ints.deallocate(block, 5).unwrap() };
    }

    #[test]
    fn test_equality_follows_arenas() {
        let first = Scratch::new();
        let second = Scratch::new();
        let a: ArenaAllocator<'_, u32, _> = ArenaAllocator::new(&first);
        let b: ArenaAllocator<'_, u32, _> = ArenaAllocator::new(&second);
        assert!(a == a.rebind::<u8>());
        assert!(a == ArenaAllocator::<u64, _>::new(&first));
        assert!(a != b);

        let heap_one = HeapArena::new();
        let heap_two = HeapArena::new();
        assert!(ArenaAllocator::<u8, _>::new(&heap_one) == ArenaAllocator::<u16, _>::new(&heap_two));
    }

    #[test]
    fn test_rebound_adapter_releases_original_block() {
        let scratch = Scratch::new();
        let ints: ArenaAllocator<'_, u32, _> = ArenaAllocator::new(&scratch);
        let block = ints.allocate(8).unwrap();
        let bytes = ints.rebind::<u8>();
        unsafe { bytes.deallocate(block.cast::<u8>(), 32).unwrap() };
    }

    #[test]
    fn test_assignment_never_rebinds() {
        let first = Scratch::new();
        let second = Scratch::new();
        let mut a: ArenaAllocator<'_, u32, _> = ArenaAllocator::new(&first);
        let b: ArenaAllocator<'_, u32, _> = ArenaAllocator::new(&second);
        assert_eq!(a.assign_from(&b), Err(ArenaError::ArenaMismatch));
        assert!(std::ptr::eq(a.arena(), &first));
        let rebound = a.rebind::<u16>();
        assert_eq!(a.assign_from(&rebound), Ok(()));
    }

    #[test]
    fn test_max_size() {
        let scratch = Scratch::new();
        assert_eq!(ArenaAllocator::<u32, _>::new(&scratch).max_size(), (1 << 20) / 4);
        assert_eq!(ArenaAllocator::<(), _>::new(&scratch).max_size(), usize::MAX);
        let heap = HeapArena::new();
        assert_eq!(ArenaAllocator::<u64, _>::new(&heap).max_size(), usize::MAX / 8);
    }

    #[test]
    fn test_container_over_heap() {
        let heap = HeapArena::new();
        let mut values = allocator_api2::vec::Vec::new_in(ArenaAllocator::<u64, _>::new(&heap));
        for value in 0..1000u64 {
            values.push(value * 3);
        }
        assert_eq!(values.len(), 1000);
        assert_eq!(values[999], 2997);
        assert_eq!(values.iter().sum::<u64>(), 3 * 999 * 1000 / 2);
    }

    #[test]
    fn test_container_over_fixed_arena() {
        let arena: FixedArena = FixedArena::new(&FixedArenaConfig {
            alignment: 16,
            chunk_size: 4096,
            ..FixedArenaConfig::new(256)
        })
        .unwrap();
        let mut values = allocator_api2::vec::Vec::with_capacity_in(16, ArenaAllocator::<u128, _>::new(&arena));
        values.extend(0..16u128);
        assert_eq!(values.iter().sum::<u128>(), 120);

        // Growth past max_size fails cleanly.
        assert!(values.try_reserve(1000).is_err());
    }
}
