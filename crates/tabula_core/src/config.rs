//! Storage configuration.
//!
//! # Responsibility
//! - Describe where the database lives and how connections are tuned.
//! - Load that description from `TABULA_*` environment variables.

use crate::db::DbOptions;
use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DB_PATH: &str = "TABULA_DB_PATH";
pub const ENV_DB_BUSY_TIMEOUT_MS: &str = "TABULA_DB_BUSY_TIMEOUT_MS";

const MEMORY_PATH: &str = ":memory:";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Physical location of the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum DatabaseLocation {
    /// Process-local database shared by all sessions of one `Storage`.
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub location: DatabaseLocation,
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: DatabaseLocation::Memory,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            foreign_keys: true,
        }
    }
}

impl StorageConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: DatabaseLocation::File(path.into()),
            ..Self::default()
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// An unset or `:memory:` path selects the in-memory database.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StorageResult<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH) {
            let path = path.trim();
            if !path.is_empty() && path != MEMORY_PATH {
                config.location = DatabaseLocation::File(PathBuf::from(path));
            }
        }

        if let Some(raw) = lookup(ENV_DB_BUSY_TIMEOUT_MS) {
            config.busy_timeout_ms = raw.trim().parse().map_err(|_| {
                StorageError::invalid_argument(format!(
                    "{ENV_DB_BUSY_TIMEOUT_MS} must be a non-negative integer, got `{raw}`"
                ))
            })?;
        }

        Ok(config)
    }

    pub(crate) fn db_options(&self) -> DbOptions {
        DbOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            foreign_keys: self.foreign_keys,
        }
    }
}
