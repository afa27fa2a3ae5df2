//! # Memory Management
//!
//! Arenas, pools and the allocator adapter.
//!
//! ## Layering
//!
//! ```text
//!   ArenaAllocator<T>            (element-typed view of any arena)
//!         │
//!   FixedMemoryTable ──oversized──▶ backing arena
//!         │ size class
//!   FixedArena ──▶ FixedSizePool ──chunks──▶ backing arena
//!                                              │
//!                                  HeapArena / GlobalArena
//! ```

mod adapter;
mod arena;
mod fixed;
mod free_list;
pub(crate) mod heap;
mod pool;
mod table;

pub use adapter::ArenaAllocator;
pub use arena::{same_arena, AllocRequest, Alignment, Arena, ArenaIdentity};
pub use fixed::{FixedArena, PoolLock};
pub use heap::HeapArena;
pub use pool::{FixedSizePool, PoolKey, PoolStats, CHUNK_HEADER_SIZE};
pub use table::{FixedMemoryTable, TableKey};
