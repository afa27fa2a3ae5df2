//! # Global Allocation Hooks
//!
//! The process-wide allocation entry points: the native aligned primitive,
//! plus an optional exhaustion handler that gets a bounded number of chances
//! to release memory before an allocation finally fails.
//!
//! [`HookedAllocator`] exposes the same path as a `GlobalAlloc`:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: larder_core::HookedAllocator = larder_core::HookedAllocator;
//! ```

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ArenaResult;
use crate::memory::heap::{block_layout, native_allocate, native_deallocate, release_checked};
use crate::memory::{AllocRequest, Alignment, Arena, ArenaIdentity};

/// Upper bound on handler invocations for one allocation.
pub const MAX_EXHAUSTION_RETRIES: usize = 8;

/// Called when the native allocator fails.
///
/// Returns `true` if it released memory and the allocation should be
/// retried, `false` if it has nothing left to give.
pub type ExhaustionHandler = Arc<dyn Fn() -> bool + Send + Sync>;

static EXHAUSTION_HANDLER: RwLock<Option<ExhaustionHandler>> = RwLock::new(None);

/// Installs (or with `None`, removes) the exhaustion handler.
///
/// Returns the previously installed handler.
pub fn set_exhaustion_handler(handler: Option<ExhaustionHandler>) -> Option<ExhaustionHandler> {
    let previous = std::mem::replace(&mut *EXHAUSTION_HANDLER.write(), handler);
    tracing::debug!(
        installed = EXHAUSTION_HANDLER.read().is_some(),
        replaced = previous.is_some(),
        "exhaustion handler updated"
    );
    previous
}

/// The currently installed exhaustion handler.
#[must_use]
pub fn exhaustion_handler() -> Option<ExhaustionHandler> {
    EXHAUSTION_HANDLER.read().clone()
}

fn allocate_with_retry(size: usize, alignment: Alignment, offset: usize) -> Option<NonNull<u8>> {
    // Unrepresentable requests fail the same way on every attempt.
    block_layout(size, alignment)?;

    let mut attempts = 0;
    loop {
        if let Some(ptr) = native_allocate(size, alignment, offset) {
            return Some(ptr);
        }
        if attempts == MAX_EXHAUSTION_RETRIES {
            return None;
        }
        attempts += 1;

        // Clone out so the handler runs without the lock held.
        let handler = EXHAUSTION_HANDLER.read().clone()?;
        if !handler() {
            return None;
        }
    }
}

/// Allocates through the native primitive, consulting the exhaustion
/// handler on failure.
///
/// Returns `None` for a zero size or a size no block layout can hold
/// (without consulting the handler), or once the handler is absent, gives
/// up, or has been retried [`MAX_EXHAUSTION_RETRIES`] times.
#[must_use]
pub fn global_allocate(size: usize, alignment: Alignment, offset: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    let ptr = allocate_with_retry(size, alignment, offset);
    if ptr.is_none() {
        tracing::warn!(size, alignment = alignment.get(), offset, "global allocation failed");
    }
    ptr
}

/// Releases memory from [`global_allocate`].
///
/// # Errors
///
/// As [`crate::memory::HeapArena`]: a pointer with size zero, or a size
/// that differs from the allocation, is a contract violation.
///
/// # Safety
///
/// `ptr` must come from [`global_allocate`] (or a heap arena) and must not
/// be released twice.
pub unsafe fn global_deallocate(ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
    // SAFETY: forwarded contract.
    unsafe { release_checked(ptr, size) }
}

/// The global hooks as an [`Arena`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalArena;

impl GlobalArena {
    /// Creates the arena.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Arena for GlobalArena {
    #[inline]
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        global_allocate(request.size, request.alignment, request.offset)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        // SAFETY: forwarded contract.
        unsafe { global_deallocate(ptr, size) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        ArenaIdentity::Global
    }
}

/// A `GlobalAlloc` over the hooks.
///
/// Never logs: a subscriber that allocates would recurse into it.
#[derive(Clone, Copy, Debug, Default)]
pub struct HookedAllocator;

// SAFETY: `native_allocate` honors the layout's size and alignment, and
// `native_deallocate` recovers the block from its header.
unsafe impl GlobalAlloc for HookedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate_with_retry(layout.size(), Alignment::from_layout(layout), 0)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `ptr` came from `alloc` above.
            unsafe { native_deallocate(ptr) };
        }
    }
}
