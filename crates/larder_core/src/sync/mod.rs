//! # Synchronization & Process-Wide State
//!
//! Pool locks, the process registry that hosts shared pools, and the
//! default-allocator claim slots.

mod default_slot;
mod lock;
mod registry;

pub use default_slot::{default_slots, DefaultCandidate, DefaultSlots};
pub use lock::{LocalLock, SharedLock};
pub use registry::{process_registry, EntryState, ProcessRegistry, ShutdownGuard};
