//! Intrusive free list threaded through the free slots themselves.
//!
//! The first word of a free slot holds the link to the next free slot. In
//! debug builds the rest of the slot is filled with [`POISON`] and checked
//! again when the slot is handed back out, which catches writes through
//! dangling pointers.

#![allow(unsafe_code)]

use std::mem;
use std::ptr::{self, NonNull};

type Link = Option<NonNull<u8>>;

const LINK_SIZE: usize = mem::size_of::<Link>();

/// Fill byte for the non-link part of a free slot (debug builds).
pub(crate) const POISON: u8 = 0xDD;

/// LIFO stack of free slots.
pub(crate) struct FreeList {
    head: Link,
    len: usize,
    slot_size: usize,
}

impl FreeList {
    /// An empty list for slots of `slot_size` bytes.
    ///
    /// `slot_size` must be at least one pointer wide.
    pub(crate) const fn new(slot_size: usize) -> Self {
        assert!(slot_size >= LINK_SIZE, "slot too small to hold a free-list link");
        Self {
            head: None,
            len: 0,
            slot_size,
        }
    }

    /// Number of free slots.
    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Pushes a slot.
    ///
    /// # Safety
    ///
    /// `slot` must point to `slot_size` writable bytes that no one else uses
    /// until the slot is popped again.
    pub(crate) unsafe fn push(&mut self, slot: NonNull<u8>) {
        // SAFETY: caller hands over `slot_size` writable bytes.
        unsafe {
            #[cfg(debug_assertions)]
            ptr::write_bytes(slot.as_ptr().add(LINK_SIZE), POISON, self.slot_size - LINK_SIZE);
            ptr::write_unaligned(slot.as_ptr().cast::<Link>(), self.head);
        }
        self.head = Some(slot);
        self.len += 1;
    }

    /// Pops the most recently pushed slot.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the slot was written to while free.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let slot = self.head?;
        // SAFETY: every slot on the list was pushed with `slot_size` bytes
        // that stay reserved for the list.
        unsafe {
            debug_assert!(
                self.poison_intact(slot),
                "use-after-free detected: free slot {slot:p} was written to"
            );
            self.head = ptr::read_unaligned(slot.as_ptr().cast::<Link>());
        }
        self.len -= 1;
        Some(slot)
    }

    /// Whether `slot` is currently on the list. O(len).
    pub(crate) fn contains(&self, slot: NonNull<u8>) -> bool {
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == slot {
                return true;
            }
            // SAFETY: list members hold a valid link in their first word.
            cursor = unsafe { ptr::read_unaligned(current.as_ptr().cast::<Link>()) };
        }
        false
    }

    unsafe fn poison_intact(&self, slot: NonNull<u8>) -> bool {
        // SAFETY: forwarded from `pop`.
        let tail = unsafe {
            std::slice::from_raw_parts(slot.as_ptr().add(LINK_SIZE), self.slot_size - LINK_SIZE)
        };
        tail.iter().all(|byte| *byte == POISON)
    }
}
