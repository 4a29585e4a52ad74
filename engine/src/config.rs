//! Engine configuration.
//!
//! Block geometry and index tuning, loadable from environment variables.
//!
//! # Environment Variables
//!
//! - `ENGINE_BLOCK_SIZE`: Block size in bytes (default: `40960`)
//! - `ENGINE_BLOCK_HEADER_SIZE`: Block header size in bytes (default: `48`)
//! - `ENGINE_MIN_ENTRIES_PER_NODE`: Minimum entries per tree node (default: `36`)
//! - `ENGINE_NODE_CACHE_CAPACITY`: Clean nodes kept in memory by the disk index (default: `200`)
//!
//! # Invariants
//!
//! A config returned by `from_env()` or accepted by `validate()` satisfies:
//! - `block_size >= 128` and is a multiple of its sector size
//! - `48 <= block_header_size < block_size`
//! - `min_entries_per_node >= 1`
//! - `node_cache_capacity >= 1`

use crate::storage::{BlockGeometry, MIN_RECORD_HEADER_SIZE};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of every block in the stream.
    pub block_size: usize,
    /// Bytes reserved at the start of each block for header slots.
    pub block_header_size: usize,
    /// Minimum entries per non-root node; nodes split above twice this.
    pub min_entries_per_node: usize,
    /// Capacity of the disk index's clean node cache.
    pub node_cache_capacity: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            block_header_size: Self::DEFAULT_BLOCK_HEADER_SIZE,
            min_entries_per_node: Self::DEFAULT_MIN_ENTRIES_PER_NODE,
            node_cache_capacity: Self::DEFAULT_NODE_CACHE_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub const DEFAULT_BLOCK_SIZE: usize = crate::storage::DEFAULT_BLOCK_SIZE;
    pub const DEFAULT_BLOCK_HEADER_SIZE: usize = crate::storage::DEFAULT_BLOCK_HEADER_SIZE;
    pub const DEFAULT_MIN_ENTRIES_PER_NODE: usize = 36;
    pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 200;

    const BLOCK_SIZE_VAR: &'static str = "ENGINE_BLOCK_SIZE";
    const BLOCK_HEADER_SIZE_VAR: &'static str = "ENGINE_BLOCK_HEADER_SIZE";
    const MIN_ENTRIES_VAR: &'static str = "ENGINE_MIN_ENTRIES_PER_NODE";
    const NODE_CACHE_VAR: &'static str = "ENGINE_NODE_CACHE_CAPACITY";

    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset variables take their default.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not a positive integer,
    /// or if the resulting configuration fails `validate()`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            block_size: load_usize(&lookup, Self::BLOCK_SIZE_VAR, Self::DEFAULT_BLOCK_SIZE)?,
            block_header_size: load_usize(
                &lookup,
                Self::BLOCK_HEADER_SIZE_VAR,
                Self::DEFAULT_BLOCK_HEADER_SIZE,
            )?,
            min_entries_per_node: load_usize(
                &lookup,
                Self::MIN_ENTRIES_VAR,
                Self::DEFAULT_MIN_ENTRIES_PER_NODE,
            )?,
            node_cache_capacity: load_usize(
                &lookup,
                Self::NODE_CACHE_VAR,
                Self::DEFAULT_NODE_CACHE_CAPACITY,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants listed in the module docs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        BlockGeometry::new(self.block_size, self.block_header_size).map_err(|e| {
            ConfigError::InvalidValue {
                name: Self::BLOCK_SIZE_VAR.to_string(),
                message: e.to_string(),
            }
        })?;

        if self.block_header_size < MIN_RECORD_HEADER_SIZE {
            return Err(ConfigError::InvalidValue {
                name: Self::BLOCK_HEADER_SIZE_VAR.to_string(),
                message: format!(
                    "{} is below the {MIN_RECORD_HEADER_SIZE}-byte record header",
                    self.block_header_size
                ),
            });
        }
        if self.min_entries_per_node == 0 {
            return Err(ConfigError::InvalidValue {
                name: Self::MIN_ENTRIES_VAR.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.node_cache_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: Self::NODE_CACHE_VAR.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn load_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid non-negative integer"),
        }),
        None => Ok(default),
    }
}
