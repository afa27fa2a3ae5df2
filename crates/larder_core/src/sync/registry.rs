//! # Process Registry
//!
//! Lazily constructed, process-duration instances keyed by
//! `(type, key type, key value)`.
//!
//! ## Entry Lifecycle
//!
//! ```text
//!   Uninitialized ──first get──▶ Constructing ──init ok──▶ Ready ──shutdown──▶ Destroyed
//!         ▲                           │
//!         └────init failed/panicked───┘
//! ```
//!
//! Construction is exactly-once: concurrent first callers block on the
//! entry lock and all receive the same `Arc`. Teardown is explicit
//! ([`ProcessRegistry::shutdown`] or a [`ShutdownGuard`]) and runs in
//! ascending priority, newest entry first within a priority.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{ArenaError, ArenaResult};

const UNINITIALIZED: u8 = 0;
const CONSTRUCTING: u8 = 1;
const READY: u8 = 2;
const DESTROYED: u8 = 3;

/// Lifecycle state of one registry entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Never constructed, or the last construction failed.
    Uninitialized,
    /// An initializer is running.
    Constructing,
    /// Constructed and available.
    Ready,
    /// Torn down; terminal.
    Destroyed,
}

impl EntryState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            CONSTRUCTING => Self::Constructing,
            READY => Self::Ready,
            DESTROYED => Self::Destroyed,
            _ => Self::Uninitialized,
        }
    }
}

struct Slot<T> {
    label: String,
    state: AtomicU8,
    builder: Mutex<Option<ThreadId>>,
    value: Mutex<Option<Arc<T>>>,
}

impl<T> Slot<T> {
    fn new(label: String) -> Self {
        Self {
            label,
            state: AtomicU8::new(UNINITIALIZED),
            builder: Mutex::new(None),
            value: Mutex::new(None),
        }
    }

    fn state(&self) -> EntryState {
        EntryState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn built_by_current_thread(&self) -> bool {
        *self.builder.lock() == Some(thread::current().id())
    }
}

/// Resets a slot to `Uninitialized` unless construction completed.
struct ConstructionGuard<'a, T> {
    slot: &'a Slot<T>,
    completed: bool,
}

impl<'a, T> ConstructionGuard<'a, T> {
    fn begin(slot: &'a Slot<T>) -> Self {
        *slot.builder.lock() = Some(thread::current().id());
        slot.state.store(CONSTRUCTING, Ordering::Release);
        Self {
            slot,
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
        *self.slot.builder.lock() = None;
        self.slot.state.store(READY, Ordering::Release);
    }
}

impl<T> Drop for ConstructionGuard<'_, T> {
    fn drop(&mut self) {
        if !self.completed {
            *self.slot.builder.lock() = None;
            self.slot.state.store(UNINITIALIZED, Ordering::Release);
        }
    }
}

trait Teardown: Send + Sync {
    fn label(&self) -> &str;
    fn destroy(&self);
}

impl<T: Send + Sync> Teardown for Slot<T> {
    fn label(&self) -> &str {
        &self.label
    }

    fn destroy(&self) {
        let value = {
            let mut value = self.value.lock();
            self.state.store(DESTROYED, Ordering::Release);
            value.take()
        };
        drop(value);
    }
}

struct TeardownEntry {
    priority: i32,
    sequence: u64,
    slot: Arc<dyn Teardown>,
}

type SlotMap<T, K> = HashMap<K, Arc<Slot<T>>>;

/// Keyed store of lazily constructed, shared instances.
///
/// # Example
///
/// ```rust,ignore
/// let registry = ProcessRegistry::new();
/// let pool = registry.get_or_try_init(&key, || FixedSizePool::new(key))?;
/// let same = registry.get_or_try_init(&key, || FixedSizePool::new(key))?;
/// assert!(Arc::ptr_eq(&pool, &same));
///
/// registry.shutdown();
/// ```
pub struct ProcessRegistry {
    maps: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    teardown: Mutex<Vec<TeardownEntry>>,
    sequence: AtomicU64,
    shut_down: AtomicBool,
}

impl ProcessRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(HashMap::new()),
            teardown: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the entry for `key`, building it with `T::default()` on first
    /// use.
    ///
    /// # Errors
    ///
    /// See [`ProcessRegistry::get_or_try_init_with_priority`].
    pub fn get<T, K>(&self, key: &K) -> ArenaResult<Arc<T>>
    where
        T: Default + Send + Sync + 'static,
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    {
        self.get_or_try_init(key, || Ok(T::default()))
    }

    /// Returns the entry for `key`, building it with `init` on first use.
    ///
    /// # Errors
    ///
    /// See [`ProcessRegistry::get_or_try_init_with_priority`].
    pub fn get_or_init<T, K, F>(&self, key: &K, init: F) -> ArenaResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.get_or_try_init(key, || Ok(init()))
    }

    /// Returns the entry for `key`, building it with a fallible `init` on
    /// first use. The entry is torn down at priority 0.
    ///
    /// # Errors
    ///
    /// See [`ProcessRegistry::get_or_try_init_with_priority`].
    pub fn get_or_try_init<T, K, F>(&self, key: &K, init: F) -> ArenaResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
        F: FnOnce() -> ArenaResult<T>,
    {
        self.get_or_try_init_with_priority(key, 0, init)
    }

    /// Returns the entry for `key`, building it with `init` on first use and
    /// scheduling its teardown at `priority` (lower runs first).
    ///
    /// A failed `init` leaves the entry uninitialized, so a later call
    /// retries.
    ///
    /// # Errors
    ///
    /// - [`ArenaError::RegistryShutDown`] after [`ProcessRegistry::shutdown`]
    /// - [`ArenaError::RecursiveConstruction`] if `init` asks for its own
    ///   entry
    /// - whatever `init` returns
    pub fn get_or_try_init_with_priority<T, K, F>(
        &self,
        key: &K,
        priority: i32,
        init: F,
    ) -> ArenaResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
        F: FnOnce() -> ArenaResult<T>,
    {
        if self.is_shut_down() {
            return Err(ArenaError::RegistryShutDown);
        }
        let slot = self.slot::<T, K>(key)?;

        match slot.state() {
            EntryState::Ready => {
                if let Some(value) = slot.value.lock().as_ref() {
                    return Ok(Arc::clone(value));
                }
            }
            EntryState::Destroyed => return Err(ArenaError::RegistryShutDown),
            EntryState::Constructing if slot.built_by_current_thread() => {
                return Err(ArenaError::RecursiveConstruction(slot.label.clone()));
            }
            _ => {}
        }

        let mut value = slot.value.lock();
        match slot.state() {
            EntryState::Ready => {
                if let Some(existing) = value.as_ref() {
                    return Ok(Arc::clone(existing));
                }
            }
            EntryState::Destroyed => return Err(ArenaError::RegistryShutDown),
            _ => {}
        }

        let guard = ConstructionGuard::begin(&slot);
        let constructed = Arc::new(init()?);
        *value = Some(Arc::clone(&constructed));
        guard.complete();
        drop(value);

        let sequence = self.schedule_teardown(Arc::clone(&slot) as Arc<dyn Teardown>, priority)?;
        tracing::debug!(entry = %slot.label, sequence, priority, "registry entry constructed");
        Ok(constructed)
    }

    /// Current state of the entry for `key`, without constructing it.
    #[must_use]
    pub fn state_of<T, K>(&self, key: &K) -> EntryState
    where
        T: Send + Sync + 'static,
        K: Hash + Eq + Send + Sync + 'static,
    {
        let maps = self.maps.lock();
        maps.get(&TypeId::of::<(T, K)>())
            .and_then(|map| map.downcast_ref::<SlotMap<T, K>>())
            .and_then(|map| map.get(key))
            .map_or(EntryState::Uninitialized, |slot| slot.state())
    }

    /// Number of constructed entries awaiting teardown.
    #[must_use]
    pub fn len(&self) -> usize {
        self.teardown.lock().len()
    }

    /// Whether no constructed entry awaits teardown.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`ProcessRegistry::shutdown`] has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Destroys every constructed entry and refuses further requests.
    ///
    /// Entries go in ascending priority; within a priority, in reverse
    /// construction order. Returns how many entries were destroyed; a second
    /// call destroys nothing.
    pub fn shutdown(&self) -> usize {
        let mut entries = {
            let mut pending = self.teardown.lock();
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return 0;
            }
            mem::take(&mut *pending)
        };
        entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });

        for entry in &entries {
            tracing::debug!(entry = entry.slot.label(), priority = entry.priority, "destroying registry entry");
            entry.slot.destroy();
        }
        tracing::debug!(destroyed = entries.len(), "process registry shut down");
        entries.len()
    }

    /// A guard that shuts this registry down when dropped.
    #[must_use]
    pub fn guard(&self) -> ShutdownGuard<'_> {
        ShutdownGuard { registry: self }
    }

    fn slot<T, K>(&self, key: &K) -> ArenaResult<Arc<Slot<T>>>
    where
        T: Send + Sync + 'static,
        K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    {
        let mut maps = self.maps.lock();
        let map = maps
            .entry(TypeId::of::<(T, K)>())
            .or_insert_with(|| Box::new(SlotMap::<T, K>::new()) as Box<dyn Any + Send + Sync>)
            .downcast_mut::<SlotMap<T, K>>()
            .ok_or(ArenaError::ContractViolation("registry map stored under a foreign type"))?;
        let slot = map
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new(format!("{}[{key:?}]", type_name::<T>()))));
        Ok(Arc::clone(slot))
    }

    fn schedule_teardown(&self, slot: Arc<dyn Teardown>, priority: i32) -> ArenaResult<u64> {
        let mut pending = self.teardown.lock();
        if self.is_shut_down() {
            drop(pending);
            slot.destroy();
            return Err(ArenaError::RegistryShutDown);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        pending.push(TeardownEntry {
            priority,
            sequence,
            slot,
        });
        Ok(sequence)
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("entries", &self.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Shuts its registry down when dropped.
///
/// Hold one for the lifetime of `main` to get deterministic teardown of
/// shared pools.
#[must_use = "the registry shuts down when the guard is dropped"]
#[derive(Debug)]
pub struct ShutdownGuard<'a> {
    registry: &'a ProcessRegistry,
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

/// The process-wide registry that hosts shared pools.
#[must_use]
pub fn process_registry() -> &'static ProcessRegistry {
    static REGISTRY: OnceLock<ProcessRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ProcessRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Counter(AtomicUsize);

    #[test]
    fn test_same_instance_for_same_key() {
        let registry = ProcessRegistry::new();
        let a: Arc<Counter> = registry.get(&"alpha").unwrap();
        let b: Arc<Counter> = registry.get(&"alpha").unwrap();
        let c: Arc<Counter> = registry.get(&"beta").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_keys_are_typed() {
        let registry = ProcessRegistry::new();
        let by_str: Arc<Counter> = registry.get(&"one").unwrap();
        let by_int: Arc<Counter> = registry.get(&1u32).unwrap();
        assert!(!Arc::ptr_eq(&by_str, &by_int));
    }

    #[test]
    fn test_failed_init_can_retry() {
        let registry = ProcessRegistry::new();
        let failed = registry.get_or_try_init::<Counter, _, _>(&7u8, || {
            Err(ArenaError::InvalidConfig("not yet".to_string()))
        });
        assert!(failed.is_err());
        assert_eq!(registry.state_of::<Counter, u8>(&7), EntryState::Uninitialized);

        let ok: Arc<Counter> = registry.get(&7u8).unwrap();
        assert_eq!(ok.0.load(Ordering::Relaxed), 0);
        assert_eq!(registry.state_of::<Counter, u8>(&7), EntryState::Ready);
    }

    #[test]
    fn test_recursive_construction_is_reported() {
        let registry = ProcessRegistry::new();
        let outer = registry.get_or_try_init::<Counter, _, _>(&"loop", || {
            let inner = registry.get::<Counter, _>(&"loop");
            assert!(matches!(inner, Err(ArenaError::RecursiveConstruction(_))));
            Ok(Counter::default())
        });
        assert!(outer.is_ok());
    }

    #[test]
    fn test_shutdown_order_and_priority() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Noisy(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl Drop for Noisy {
            fn drop(&mut self) {
                self.1.lock().push(self.0);
            }
        }

        let registry = ProcessRegistry::new();
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            drop(registry.get_or_init(&name, move || Noisy(name, order)).unwrap());
        }
        let early = Arc::clone(&order);
        drop(
            registry
                .get_or_try_init_with_priority(&"early", -1, move || Ok(Noisy("early", early)))
                .unwrap(),
        );

        assert_eq!(registry.shutdown(), 4);
        assert_eq!(*order.lock(), vec!["early", "third", "second", "first"]);
        assert_eq!(registry.shutdown(), 0);
    }

    #[test]
    fn test_lifecycle_error_after_shutdown() {
        let registry = ProcessRegistry::new();
        let _: Arc<Counter> = registry.get(&"live").unwrap();
        {
            let _guard = registry.guard();
        }
        assert!(registry.is_shut_down());
        assert_eq!(registry.state_of::<Counter, &str>(&"live"), EntryState::Destroyed);
        assert_eq!(
            registry.get::<Counter, _>(&"live").unwrap_err(),
            ArenaError::RegistryShutDown
        );
        assert_eq!(
            registry.get::<Counter, _>(&"fresh").unwrap_err(),
            ArenaError::RegistryShutDown
        );
    }

    #[test]
    fn test_held_arc_outlives_shutdown() {
        let registry = ProcessRegistry::new();
        let held: Arc<Counter> = registry.get(&"kept").unwrap();
        registry.shutdown();
        held.0.fetch_add(1, Ordering::Relaxed);
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
