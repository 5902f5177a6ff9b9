//! Engine configuration module.
//!
//! Configuration is read from environment variables.
//!
//! # Environment Variables
//!
//! - `BTREE_DATA_FILE`: Path of the block file holding the tree (required)
//! - `BTREE_CACHE_PAGES`: Buffer cache capacity in pages (default: `1024`)
//! - `BTREE_BATCH_SIZE`: Pairs delivered per scan batch (default: `64`)
//!
//! # Invariants
//!
//! - `cache_pages` is at least 2, enough for a parent and a child lock
//! - `batch_size` is at least 1

use std::path::PathBuf;

use crate::btree::DEFAULT_BATCH_SIZE;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Block file holding the superblock and nodes.
    pub data_file: PathBuf,
    /// Pages the buffer cache may keep resident.
    pub cache_pages: usize,
    /// Pairs per delivered scan batch.
    pub batch_size: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Default buffer cache capacity.
    pub const DEFAULT_CACHE_PAGES: usize = 1024;
    /// Smallest usable cache: one parent and one child.
    pub const MIN_CACHE_PAGES: usize = 2;

    pub const DATA_FILE_VAR: &'static str = "BTREE_DATA_FILE";
    pub const CACHE_PAGES_VAR: &'static str = "BTREE_CACHE_PAGES";
    pub const BATCH_SIZE_VAR: &'static str = "BTREE_BATCH_SIZE";

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `BTREE_DATA_FILE` is not set or is empty
    /// - `BTREE_CACHE_PAGES` or `BTREE_BATCH_SIZE` is set but not a valid
    ///   number in range
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_file = Self::load_data_file(&lookup)?;
        let cache_pages = Self::load_count(
            &lookup,
            Self::CACHE_PAGES_VAR,
            Self::DEFAULT_CACHE_PAGES,
            Self::MIN_CACHE_PAGES,
        )?;
        let batch_size = Self::load_count(&lookup, Self::BATCH_SIZE_VAR, DEFAULT_BATCH_SIZE, 1)?;

        Ok(Self {
            data_file,
            cache_pages,
            batch_size,
        })
    }

    fn load_data_file(lookup: &impl Fn(&str) -> Option<String>) -> Result<PathBuf, ConfigError> {
        let path = lookup(Self::DATA_FILE_VAR)
            .ok_or_else(|| ConfigError::MissingEnvVar(Self::DATA_FILE_VAR.to_string()))?;

        if path.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: Self::DATA_FILE_VAR.to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(PathBuf::from(path))
    }

    /// Load a count, falling back to `default` when unset.
    fn load_count(
        lookup: &impl Fn(&str) -> Option<String>,
        name: &str,
        default: usize,
        min: usize,
    ) -> Result<usize, ConfigError> {
        let Some(value) = lookup(name) else {
            return Ok(default);
        };
        match value.parse::<usize>() {
            Ok(count) if count >= min => Ok(count),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a whole number of at least {min}"),
            }),
        }
    }
}
