//! Recovery configuration module.
//!
//! This module loads cleaner and recovery settings from environment
//! variables.
//!
//! # Environment Variables
//!
//! - `GBPTREE_FILE`: Tree file to recover (required for recovery)
//! - `GBPTREE_PAGE_SIZE`: Page size of the tree file (default: `8192`)
//! - `GBPTREE_CLEANER_WORKERS`: Cleanup worker count (default: `min(8, cores)`)
//!
//! # Invariants
//!
//! - `workers` is always at least 1
//! - `page_size` is always non-zero

use std::path::PathBuf;

/// Crash generation cleaner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// Number of worker tasks scanning pages in parallel.
    pub workers: usize,
}

/// Settings for the `gbptree-recover` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Tree file to recover.
    pub file: PathBuf,
    /// Page size the file was created with.
    pub page_size: usize,
    pub cleaner: CleanerConfig,
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

impl CleanerConfig {
    /// Upper bound of the default worker count.
    pub const MAX_DEFAULT_WORKERS: usize = 8;

    pub const WORKERS_VAR: &'static str = "GBPTREE_CLEANER_WORKERS";

    /// `min(8, available cores)`, at least 1.
    #[must_use]
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(Self::MAX_DEFAULT_WORKERS)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// or `None` if it is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let workers = match lookup(Self::WORKERS_VAR) {
            Some(value) => parse_positive(Self::WORKERS_VAR, &value)?,
            None => Self::default_workers(),
        };
        Ok(Self { workers })
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
        }
    }
}

impl RecoveryConfig {
    /// Default page size.
    pub const DEFAULT_PAGE_SIZE: usize = 8192;

    pub const FILE_VAR: &'static str = "GBPTREE_FILE";
    pub const PAGE_SIZE_VAR: &'static str = "GBPTREE_PAGE_SIZE";

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `GBPTREE_FILE` is not set or is empty
    /// - `GBPTREE_PAGE_SIZE` or `GBPTREE_CLEANER_WORKERS` is set but not a
    ///   positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = lookup(Self::FILE_VAR)
            .ok_or_else(|| ConfigError::MissingEnvVar(Self::FILE_VAR.to_string()))?;
        if file.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: Self::FILE_VAR.to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let page_size = match lookup(Self::PAGE_SIZE_VAR) {
            Some(value) => parse_positive(Self::PAGE_SIZE_VAR, &value)?,
            None => Self::DEFAULT_PAGE_SIZE,
        };

        Ok(Self {
            file: PathBuf::from(file),
            page_size,
            cleaner: CleanerConfig::from_lookup(&lookup)?,
        })
    }
}

fn parse_positive(name: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a positive integer"),
        }),
    }
}
