//! # LARDER Core
//!
//! Aligned arenas, fixed-size pools and allocator adapters:
//! - Offset-aware aligned allocation on the native heap
//! - Size-class pools shared process-wide by configuration
//! - An element-typed adapter usable by generic containers
//! - A keyed process registry with explicit, ordered teardown
//!
//! ## Rules
//!
//! 1. **Exhaustion is not an error** - `allocate` returns `None`
//! 2. **Contract violations are** - `deallocate` reports them as `ArenaError`
//! 3. **Equal arenas are interchangeable** - memory from one may be released through the other
//!
//! ## Example
//!
//! ```rust,ignore
//! use larder_core::{AllocRequest, Arena, FixedArena, FixedArenaConfig};
//!
//! let _teardown = larder_core::process_registry().guard();
//!
//! let particles: FixedArena = FixedArena::new(&FixedArenaConfig::new(64))?;
//! let ptr = particles.allocate(AllocRequest::new(48).named("particle")).expect("exhausted");
//! unsafe { particles.deallocate(Some(ptr), 48)? };
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod memory;
pub mod sync;

pub use config::{BackingKind, FixedArenaConfig, LarderConfig, LockKind, TableConfig};
pub use error::{ArenaError, ArenaResult};
pub use hooks::{
    exhaustion_handler, global_allocate, global_deallocate, set_exhaustion_handler,
    ExhaustionHandler, GlobalArena, HookedAllocator, MAX_EXHAUSTION_RETRIES,
};
pub use memory::{
    same_arena, AllocRequest, Alignment, Arena, ArenaAllocator, ArenaIdentity, FixedArena,
    FixedMemoryTable, FixedSizePool, HeapArena, PoolKey, PoolLock, PoolStats, TableKey,
};
pub use sync::{
    default_slots, process_registry, DefaultCandidate, DefaultSlots, EntryState, LocalLock,
    ProcessRegistry, SharedLock, ShutdownGuard,
};
