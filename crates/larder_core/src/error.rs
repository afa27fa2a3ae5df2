//! # Arena Error Types
//!
//! Everything that can go wrong outside of plain exhaustion. Exhaustion is
//! never an error: `allocate` reports it by returning `None`.

use thiserror::Error;

/// Errors raised by arenas, pools, adapters and the process registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// Alignment was zero or not a power of two.
    #[error("invalid alignment {alignment}: must be a non-zero power of two")]
    InvalidAlignment {
        /// The rejected alignment.
        alignment: usize,
    },

    /// A pool, arena or table was configured with unusable parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    /// A configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    ConfigIo(String),

    /// A block was released with a size different from the one it was
    /// allocated with.
    #[error("size mismatch on deallocate: allocated {allocated} bytes, released {released}")]
    SizeMismatch {
        /// Size recorded at allocation time.
        allocated: usize,
        /// Size passed to deallocate.
        released: usize,
    },

    /// A deallocate call broke the arena's contract.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// Two allocator adapters referring to different arenas were assigned.
    #[error("allocator adapters refer to different arenas")]
    ArenaMismatch,

    /// The process registry has been shut down.
    #[error("process registry has been shut down")]
    RegistryShutDown,

    /// An entry's initializer asked the registry for the same entry.
    #[error("recursive construction of registry entry `{0}`")]
    RecursiveConstruction(String),
}

/// Result type for arena operations.
pub type ArenaResult<T> = Result<T, ArenaError>;
