//! # Arena Configuration
//!
//! Construction-time settings for fixed arenas and size-class tables,
//! loadable from TOML once at startup.
//!
//! ```toml
//! [fixed.particles]
//! max_size = 64
//! alignment = 16
//! chunk_size = 8192
//!
//! [tables.small_objects]
//! alignment = 16
//! small_size = 256
//! backing = "global"
//! lock = "none"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, ArenaResult};
use crate::hooks::GlobalArena;
use crate::memory::{Alignment, Arena, FixedArena, FixedMemoryTable, HeapArena, PoolKey, TableKey};
use crate::sync::{LocalLock, SharedLock};

/// Bytes per chunk when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Largest size served by table pools when none is configured.
pub const DEFAULT_SMALL_SIZE: usize = 64;

/// Which arena pools and tables draw their memory from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingKind {
    /// [`HeapArena`].
    #[default]
    Heap,
    /// [`GlobalArena`] (heap plus the exhaustion handler).
    Global,
}

impl BackingKind {
    /// A shareable instance of the backing arena.
    #[must_use]
    pub fn arena(self) -> Arc<dyn Arena + Send + Sync> {
        match self {
            Self::Heap => Arc::new(HeapArena::new()),
            Self::Global => Arc::new(GlobalArena::new()),
        }
    }
}

/// How a pool is locked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// A real mutex; the pool is shared process-wide.
    #[default]
    #[serde(rename = "mutex")]
    Mutex,
    /// No cross-thread locking; every thread gets its own pool.
    #[serde(rename = "none", alias = "local")]
    Local,
}

const fn default_alignment() -> usize {
    Alignment::WORD.get()
}

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

const fn default_small_size() -> usize {
    DEFAULT_SMALL_SIZE
}

fn alignment(bytes: usize) -> ArenaResult<Alignment> {
    Alignment::new(bytes)
}

/// Settings for one [`FixedArena`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedArenaConfig {
    /// Largest request served.
    pub max_size: usize,
    /// Alignment of every block, evaluated at `offset`.
    #[serde(default = "default_alignment")]
    pub alignment: usize,
    /// Alignment displacement.
    #[serde(default)]
    pub offset: usize,
    /// Bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Where chunks come from.
    #[serde(default)]
    pub backing: BackingKind,
    /// How the pool is locked.
    #[serde(default)]
    pub lock: LockKind,
}

impl FixedArenaConfig {
    /// Word-aligned, heap-backed, mutex-guarded settings for `max_size`.
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            alignment: default_alignment(),
            offset: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backing: BackingKind::Heap,
            lock: LockKind::Mutex,
        }
    }

    /// Validates the settings into a pool key.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidAlignment`] or
    /// [`ArenaError::InvalidConfig`].
    pub fn key(&self) -> ArenaResult<PoolKey> {
        let key = PoolKey {
            max_size: self.max_size,
            alignment: alignment(self.alignment)?,
            offset: self.offset,
            chunk_size: self.chunk_size,
            backing: self.backing,
            lock: self.lock,
        };
        key.validate()?;
        Ok(key)
    }

    /// Builds the arena.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the settings are unusable.
    pub fn build(&self) -> ArenaResult<Box<dyn Arena>> {
        let key = self.key()?;
        Ok(match key.lock {
            LockKind::Mutex => Box::new(FixedArena::<SharedLock>::from_key(key)?),
            LockKind::Local => Box::new(FixedArena::<LocalLock>::from_key(key)?),
        })
    }
}

/// Settings for one [`FixedMemoryTable`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Size-class granularity and block alignment.
    #[serde(default = "default_alignment")]
    pub alignment: usize,
    /// Alignment displacement.
    #[serde(default)]
    pub offset: usize,
    /// Bytes per chunk in every size-class pool.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest size served from a pool; larger requests go to the backing.
    #[serde(default = "default_small_size")]
    pub small_size: usize,
    /// Where chunks and oversized requests come from.
    #[serde(default)]
    pub backing: BackingKind,
    /// How the pools are locked.
    #[serde(default)]
    pub lock: LockKind,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            alignment: default_alignment(),
            offset: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            small_size: DEFAULT_SMALL_SIZE,
            backing: BackingKind::Heap,
            lock: LockKind::Mutex,
        }
    }
}

impl TableConfig {
    /// Validates the settings into a table key.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidAlignment`] or
    /// [`ArenaError::InvalidConfig`].
    pub fn key(&self) -> ArenaResult<TableKey> {
        let key = TableKey {
            alignment: alignment(self.alignment)?,
            offset: self.offset,
            chunk_size: self.chunk_size,
            small_size: self.small_size,
            backing: self.backing,
            lock: self.lock,
        };
        key.validate()?;
        Ok(key)
    }

    /// Builds the table.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the settings are unusable.
    pub fn build(&self) -> ArenaResult<Box<dyn Arena>> {
        let key = self.key()?;
        Ok(match key.lock {
            LockKind::Mutex => Box::new(FixedMemoryTable::<SharedLock>::from_key(key)?),
            LockKind::Local => Box::new(FixedMemoryTable::<LocalLock>::from_key(key)?),
        })
    }
}

/// A whole configuration document: named fixed arenas and tables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LarderConfig {
    /// Fixed arenas by name.
    #[serde(default)]
    pub fixed: BTreeMap<String, FixedArenaConfig>,
    /// Size-class tables by name.
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

impl LarderConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::ConfigParse`] for malformed TOML and a
    /// configuration error for unusable settings.
    pub fn from_toml_str(source: &str) -> ArenaResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|err| ArenaError::ConfigParse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::ConfigIo`] if the file can't be read, otherwise
    /// as [`LarderConfig::from_toml_str`].
    pub fn from_path(path: impl AsRef<Path>) -> ArenaResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|err| ArenaError::ConfigIo(format!("{}: {err}", path.display())))?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(
            path = %path.display(),
            fixed = config.fixed.len(),
            tables = config.tables.len(),
            "loaded arena configuration"
        );
        Ok(config)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::ConfigParse`] if serialization fails.
    pub fn to_toml_string(&self) -> ArenaResult<String> {
        toml::to_string(self).map_err(|err| ArenaError::ConfigParse(err.to_string()))
    }

    /// Checks every entry.
    ///
    /// # Errors
    ///
    /// Returns the first entry's error, prefixed with its name for
    /// [`ArenaError::InvalidConfig`].
    pub fn validate(&self) -> ArenaResult<()> {
        for (name, fixed) in &self.fixed {
            fixed.key().map_err(|err| named(name, err))?;
        }
        for (name, table) in &self.tables {
            table.key().map_err(|err| named(name, err))?;
        }
        Ok(())
    }

    /// Builds the fixed arena called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] if there is no such entry.
    pub fn fixed_arena(&self, name: &str) -> ArenaResult<Box<dyn Arena>> {
        self.fixed
            .get(name)
            .ok_or_else(|| ArenaError::InvalidConfig(format!("no fixed arena named `{name}`")))?
            .build()
    }

    /// Builds the table called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::InvalidConfig`] if there is no such entry.
    pub fn table(&self, name: &str) -> ArenaResult<Box<dyn Arena>> {
        self.tables
            .get(name)
            .ok_or_else(|| ArenaError::InvalidConfig(format!("no table named `{name}`")))?
            .build()
    }
}

fn named(name: &str, err: ArenaError) -> ArenaError {
    match err {
        ArenaError::InvalidConfig(reason) => ArenaError::InvalidConfig(format!("`{name}`: {reason}")),
        other => other,
    }
}
