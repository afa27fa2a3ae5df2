//! # Heap Arena
//!
//! Offset-aware aligned allocation on top of the system allocator.
//!
//! ## Block Layout
//!
//! ```text
//!   base                      payload (returned)
//!   │                         │
//!   ▼                         ▼
//!   ┌─────────┬──────────────┬──────────────────────────────┐
//!   │ slack   │ BlockHeader  │ size bytes                   │
//!   │         │ base │ total │                              │
//!   │         │ requested    │                              │
//!   └─────────┴──────────────┴──────────────────────────────┘
//!                             payload + offset ≡ 0 (mod align)
//! ```
//!
//! The header is written unaligned directly in front of the payload, so the
//! block layout can be recovered from the payload pointer alone.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::mem;
use std::ptr::{self, NonNull};

use crate::error::{ArenaError, ArenaResult};
use crate::memory::arena::{AllocRequest, Alignment, Arena, ArenaIdentity};

/// Bookkeeping stored in front of every heap payload.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct BlockHeader {
    /// Start of the underlying system block.
    base: usize,
    /// Size of the underlying system block.
    total: usize,
    /// Size the caller asked for.
    requested: usize,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const BLOCK_ALIGN: usize = mem::align_of::<BlockHeader>();

/// Layout of the system block backing a `size`-byte payload, or `None` if
/// no such block can exist.
pub(crate) fn block_layout(size: usize, alignment: Alignment) -> Option<Layout> {
    let total = size.checked_add(alignment.get())?.checked_add(HEADER_SIZE)?;
    Layout::from_size_align(total, BLOCK_ALIGN).ok()
}

/// Allocates `size` bytes such that `(ptr + offset) % alignment == 0`.
///
/// Returns `None` for a zero size, on arithmetic overflow, or when the
/// system allocator fails.
pub(crate) fn native_allocate(size: usize, alignment: Alignment, offset: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }

    let layout = block_layout(size, alignment)?;
    let total = layout.size();

    // SAFETY: `layout` has a non-zero size.
    let base = NonNull::new(unsafe { System.alloc(layout) })?;
    let base_addr = base.as_ptr() as usize;

    let shift = offset & alignment.mask();
    let earliest = base_addr + HEADER_SIZE;
    // First address >= earliest whose value plus `shift` is aligned.
    let payload_addr = ((earliest + shift + alignment.mask()) & !alignment.mask()) - shift;
    debug_assert!(payload_addr >= earliest);
    debug_assert!(payload_addr + size <= base_addr + total);

    // SAFETY: `payload_addr - base_addr` is within the block (asserted
    // above), and the header fits between `base` and the payload.
    unsafe {
        let payload = base.as_ptr().add(payload_addr - base_addr);
        ptr::write_unaligned(
            payload.sub(HEADER_SIZE).cast::<BlockHeader>(),
            BlockHeader {
                base: base_addr,
                total,
                requested: size,
            },
        );
        Some(NonNull::new_unchecked(payload))
    }
}

/// Reads the size recorded for a payload.
///
/// # Safety
///
/// `ptr` must be a live payload returned by [`native_allocate`].
pub(crate) unsafe fn native_requested_size(ptr: NonNull<u8>) -> usize {
    // SAFETY: the header sits directly in front of every live payload.
    unsafe { read_header(ptr).requested }
}

/// Returns a payload's block to the system allocator.
///
/// # Safety
///
/// `ptr` must be a live payload returned by [`native_allocate`].
pub(crate) unsafe fn native_deallocate(ptr: NonNull<u8>) {
    // SAFETY: caller guarantees `ptr` is live; the header describes the
    // exact layout the block was allocated with.
    unsafe {
        let header = read_header(ptr);
        let offset_from_base = ptr.as_ptr() as usize - header.base;
        let base = ptr.as_ptr().sub(offset_from_base);
        System.dealloc(base, Layout::from_size_align_unchecked(header.total, BLOCK_ALIGN));
    }
}

unsafe fn read_header(ptr: NonNull<u8>) -> BlockHeader {
    // SAFETY: forwarded from callers.
    unsafe { ptr::read_unaligned(ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>()) }
}

/// Shared deallocate semantics of the heap-backed arenas.
///
/// The block is always released; a differing size is reported afterwards.
pub(crate) unsafe fn release_checked(ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
    let Some(ptr) = ptr else {
        return Ok(());
    };
    if size == 0 {
        return Err(ArenaError::ContractViolation(
            "non-null pointer released with size 0",
        ));
    }

    // SAFETY: caller guarantees `ptr` is a live heap payload.
    let allocated = unsafe { native_requested_size(ptr) };
    // SAFETY: as above.
    unsafe { native_deallocate(ptr) };

    if allocated == size {
        Ok(())
    } else {
        tracing::warn!(allocated, released = size, "heap block released with wrong size");
        Err(ArenaError::SizeMismatch {
            allocated,
            released: size,
        })
    }
}

/// The native heap as an [`Arena`].
///
/// Stateless; every instance is equal to every other one.
///
/// # Example
///
/// ```rust,ignore
/// let heap = HeapArena::new();
/// let request = AllocRequest::new(100).with_alignment(Alignment::new(64)?).with_offset(8);
/// let ptr = heap.allocate(request).expect("out of memory");
/// assert_eq!((ptr.as_ptr() as usize + 8) % 64, 0);
/// unsafe { heap.deallocate(Some(ptr), 100)? };
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapArena;

impl HeapArena {
    /// Creates a heap arena.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Arena for HeapArena {
    #[inline]
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        tracing::trace!(
            size = request.size,
            alignment = request.alignment.get(),
            offset = request.offset,
            name = request.name,
            "heap allocate"
        );
        native_allocate(request.size, request.alignment, request.offset)
    }

    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        // SAFETY: forwarded contract.
        unsafe { release_checked(ptr, size) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        ArenaIdentity::Heap
    }
}
