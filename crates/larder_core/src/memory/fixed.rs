//! # Fixed Arena
//!
//! A pool configuration exposed as an [`Arena`]. The pool itself is looked
//! up lazily by its [`PoolKey`], so every fixed arena (and every table
//! size class) with the same configuration shares one pool.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use parking_lot::lock_api::RawMutex;

use crate::config::{FixedArenaConfig, LockKind};
use crate::error::{ArenaError, ArenaResult};
use crate::memory::arena::{AllocRequest, Arena, ArenaIdentity};
use crate::memory::pool::{FixedSizePool, PoolKey, PoolStats};
use crate::sync::{process_registry, LocalLock, SharedLock};

/// A pool lock that also knows where pools using it are registered.
pub trait PoolLock: RawMutex + Sized + 'static {
    /// The lock kind recorded in pool keys.
    const KIND: LockKind;

    /// Shared handle to a registered pool.
    type Handle: Deref<Target = FixedSizePool<Self>> + Clone;

    /// Finds or creates the pool for `key`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unusable key, or a lifecycle
    /// error once the registry is gone.
    fn resolve(key: PoolKey) -> ArenaResult<Self::Handle>;

    /// The thread whose registry [`PoolLock::resolve`] consults, or `None`
    /// when pools are process-wide.
    fn owner() -> Option<ThreadId>;
}

impl PoolLock for SharedLock {
    const KIND: LockKind = LockKind::Mutex;
    type Handle = Arc<FixedSizePool<SharedLock>>;

    fn resolve(key: PoolKey) -> ArenaResult<Self::Handle> {
        process_registry().get_or_try_init(&key, || FixedSizePool::new(key))
    }

    fn owner() -> Option<ThreadId> {
        None
    }
}

thread_local! {
    static LOCAL_POOLS: RefCell<HashMap<PoolKey, Rc<FixedSizePool<LocalLock>>>> =
        RefCell::new(HashMap::new());
}

impl PoolLock for LocalLock {
    const KIND: LockKind = LockKind::Local;
    type Handle = Rc<FixedSizePool<LocalLock>>;

    fn resolve(key: PoolKey) -> ArenaResult<Self::Handle> {
        LOCAL_POOLS
            .try_with(|pools| {
                if let Some(pool) = pools.borrow().get(&key) {
                    return Ok(Rc::clone(pool));
                }
                let pool = Rc::new(FixedSizePool::new(key)?);
                pools.borrow_mut().insert(key, Rc::clone(&pool));
                tracing::debug!(?key, "thread-local pool constructed");
                Ok(pool)
            })
            .map_err(|_| ArenaError::RegistryShutDown)?
    }

    fn owner() -> Option<ThreadId> {
        Some(thread::current().id())
    }
}

/// Checks that `key` is usable and was made for lock `L`.
pub(crate) fn check_key<L: PoolLock>(key: &PoolKey) -> ArenaResult<()> {
    key.validate()?;
    if key.lock == L::KIND {
        Ok(())
    } else {
        Err(ArenaError::InvalidConfig(format!(
            "pool key declares lock {:?} but the arena uses {:?}",
            key.lock,
            L::KIND
        )))
    }
}

/// An [`Arena`] serving requests up to a fixed size from a shared pool.
///
/// Requests are rejected (`None`) when they are empty, larger than
/// `max_size`, use a different offset, or need a stricter alignment than
/// the configured one.
///
/// # Example
///
/// ```rust,ignore
/// let arena: FixedArena = FixedArena::new(&FixedArenaConfig {
///     alignment: 8,
///     chunk_size: 256,
///     ..FixedArenaConfig::new(32)
/// })?;
/// let ptr = arena.allocate(AllocRequest::new(32)).expect("exhausted");
/// unsafe { arena.deallocate(Some(ptr), 32)? };
/// ```
pub struct FixedArena<L: PoolLock = SharedLock> {
    key: PoolKey,
    owner: Option<ThreadId>,
    pool: OnceLock<L::Handle>,
}

impl<L: PoolLock> FixedArena<L> {
    /// Builds an arena from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the settings are unusable or name
    /// a different lock kind.
    pub fn new(config: &FixedArenaConfig) -> ArenaResult<Self> {
        Self::from_key(config.key()?)
    }

    /// Builds an arena for an explicit pool key.
    ///
    /// # Errors
    ///
    /// As [`FixedArena::new`].
    pub fn from_key(key: PoolKey) -> ArenaResult<Self> {
        check_key::<L>(&key)?;
        Ok(Self {
            key,
            owner: L::owner(),
            pool: OnceLock::new(),
        })
    }

    /// The arena's pool key.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The backing pool, resolved on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::RegistryShutDown`] if the pool registry has
    /// been torn down before first use.
    pub fn pool(&self) -> ArenaResult<&FixedSizePool<L>> {
        if let Some(handle) = self.pool.get() {
            return Ok(&**handle);
        }
        let handle = L::resolve(self.key)?;
        Ok(&**self.pool.get_or_init(|| handle))
    }

    /// Counters of the backing pool, if it has been resolved.
    #[must_use]
    pub fn stats(&self) -> Option<PoolStats> {
        self.pool.get().map(|pool| pool.stats())
    }

    fn accepts(&self, request: &AllocRequest<'_>) -> bool {
        request.size > 0
            && request.size <= self.key.max_size
            && request.offset == self.key.offset
            && request.alignment <= self.key.alignment
    }
}

impl<L: PoolLock> Arena for FixedArena<L> {
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        if !self.accepts(&request) {
            tracing::trace!(
                size = request.size,
                alignment = request.alignment.get(),
                offset = request.offset,
                max_size = self.key.max_size,
                "fixed arena rejected request"
            );
            return None;
        }
        match self.pool() {
            Ok(pool) => pool.allocate(request.name),
            Err(err) => {
                tracing::warn!(error = %err, "fixed arena has no pool");
                None
            }
        }
    }

    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        if size == 0 {
            return Err(ArenaError::ContractViolation(
                "non-null pointer released with size 0",
            ));
        }
        if size > self.key.max_size {
            return Err(ArenaError::ContractViolation(
                "released size exceeds the arena's max_size",
            ));
        }
        let pool = self.pool()?;
        // SAFETY: the caller returns a block this arena (or an equal one,
        // which shares the pool) handed out.
        unsafe { pool.deallocate(ptr) };
        Ok(())
    }

    #[inline]
    fn max_size(&self) -> usize {
        self.key.max_size
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        match self.owner {
            None => ArenaIdentity::Pool(self.key),
            Some(thread) => ArenaIdentity::LocalPool {
                key: self.key,
                thread,
            },
        }
    }
}

impl<L: PoolLock> Clone for FixedArena<L> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            owner: self.owner,
            pool: self.pool.clone(),
        }
    }
}

impl<L: PoolLock> fmt::Debug for FixedArena<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedArena")
            .field("key", &self.key)
            .field("resolved", &self.pool.get().is_some())
            .finish()
    }
}
