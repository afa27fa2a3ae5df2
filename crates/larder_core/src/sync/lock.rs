//! # Pool Locks
//!
//! Pools are generic over a `lock_api::RawMutex`:
//!
//! - [`SharedLock`]: `parking_lot::RawMutex`, for pools reachable from many
//!   threads.
//! - [`LocalLock`]: a re-entrancy flag with no atomics. It is `!Send` and
//!   `!Sync`, so a pool guarded by it can't leave the thread that built it.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::marker::PhantomData;

use parking_lot::lock_api::{GuardNoSend, RawMutex};

/// Real mutual exclusion between threads.
pub type SharedLock = parking_lot::RawMutex;

/// Single-thread lock: only guards against re-entrant use.
///
/// # Panics
///
/// `lock` panics if the lock is already held, since on a single thread
/// that can only mean re-entrancy.
pub struct LocalLock {
    held: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

// SAFETY: `held` tracks ownership on the one thread the lock can live on;
// `!Send`/`!Sync` come from the raw pointer marker, so no second thread can
// ever observe it.
unsafe impl RawMutex for LocalLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        held: Cell::new(false),
        _not_send: PhantomData,
    };

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock(&self) {
        assert!(!self.held.replace(true), "LocalLock re-entered");
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.held.replace(true)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.held.set(false);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.held.get()
    }
}
