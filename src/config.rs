//! # Store Configuration
//!
//! [`StoreConfig`] is the configuration surface recognized by the message
//! store. It can be built in code, deserialized with serde (every field has a
//! default), or read from `OUTBOXDB_*` environment variables.
//!
//! [`ProviderOptions`] configures the SQLite connection opened by
//! [`SqliteProvider`](crate::SqliteProvider).

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default delay between housekeeper passes (15 minutes).
pub const DEFAULT_HOUSEKEEPER_INTERVAL_SECS: u64 = 900;

/// Default minimum age of a terminal row before it is purged.
pub const DEFAULT_PURGE_AGE_SECS: u64 = 60;

/// Default maximum number of stored messages.
pub const DEFAULT_CAPACITY: u32 = 10_000;

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const ENV_HOUSEKEEPER_INTERVAL: &str = "OUTBOXDB_HOUSEKEEPER_INTERVAL_SECS";
const ENV_PURGE_AGE: &str = "OUTBOXDB_PURGE_AGE_SECS";
const ENV_CAPACITY: &str = "OUTBOXDB_CAPACITY";
const ENV_REPAIR_ENABLED: &str = "OUTBOXDB_REPAIR_ENABLED";
const ENV_CHECKPOINT_ENABLED: &str = "OUTBOXDB_CHECKPOINT_ENABLED";

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration of a [`MessageStore`](crate::MessageStore).
///
/// Re-applying a configuration with [`update`](crate::MessageStore::update)
/// keeps every stored row and restarts the housekeeper on the new cadence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Delay between the end of one housekeeper pass and the start of the next.
    pub housekeeper_interval_secs: u64,

    /// Minimum age of a confirmed, dropped, or published `qos = 0` row before
    /// it is purged.
    pub purge_age_secs: u64,

    /// Maximum number of rows. Reserved priorities may exceed it.
    pub capacity: u32,

    /// Run the duplicate-id repair on every housekeeper pass.
    pub repair_enabled: bool,

    /// Force an engine checkpoint at the end of every housekeeper pass.
    pub checkpoint_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            housekeeper_interval_secs: DEFAULT_HOUSEKEEPER_INTERVAL_SECS,
            purge_age_secs: DEFAULT_PURGE_AGE_SECS,
            capacity: DEFAULT_CAPACITY,
            repair_enabled: false,
            checkpoint_enabled: false,
        }
    }
}

impl StoreConfig {
    /// Builds a configuration from the three mandatory settings.
    pub fn new(housekeeper_interval_secs: u64, purge_age_secs: u64, capacity: u32) -> Self {
        Self {
            housekeeper_interval_secs,
            purge_age_secs,
            capacity,
            ..Self::default()
        }
    }

    /// Enables or disables the repair step of the housekeeper.
    pub fn with_repair(mut self, enabled: bool) -> Self {
        self.repair_enabled = enabled;
        self
    }

    /// Enables or disables the checkpoint step of the housekeeper.
    pub fn with_checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint_enabled = enabled;
        self
    }

    /// Housekeeper interval as a [`Duration`].
    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeper_interval_secs)
    }

    /// Purge age as a [`Duration`].
    pub fn purge_age(&self) -> Duration {
        Duration::from_secs(self.purge_age_secs)
    }

    /// Checks that the configuration can drive a store.
    ///
    /// A zero interval would make the housekeeper spin on the store lock.
    pub fn validate(&self) -> Result<()> {
        if self.housekeeper_interval_secs == 0 {
            return Err(Error::Config(
                "housekeeper_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads the configuration from `OUTBOXDB_*` environment variables.
    ///
    /// Unset variables keep their default value. A variable that is set but
    /// cannot be parsed is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_HOUSEKEEPER_INTERVAL) {
            config.housekeeper_interval_secs = parse_value(ENV_HOUSEKEEPER_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_PURGE_AGE) {
            config.purge_age_secs = parse_value(ENV_PURGE_AGE, &v)?;
        }
        if let Some(v) = lookup(ENV_CAPACITY) {
            config.capacity = parse_value(ENV_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_REPAIR_ENABLED) {
            config.repair_enabled = parse_bool(ENV_REPAIR_ENABLED, &v)?;
        }
        if let Some(v) = lookup(ENV_CHECKPOINT_ENABLED) {
            config.checkpoint_enabled = parse_bool(ENV_CHECKPOINT_ENABLED, &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key} '{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("invalid {key} '{value}': expected a boolean"))),
    }
}

// =============================================================================
// Provider Options
// =============================================================================

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Write-ahead log (recommended).
    #[default]
    Wal,
    /// Rollback journal, deleted at the end of each transaction.
    Delete,
}

impl JournalMode {
    /// Returns the pragma value.
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
        }
    }
}

/// SQLite synchronous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Sync on every commit.
    Full,
    /// Sync the WAL at checkpoints only.
    #[default]
    Normal,
}

impl SyncMode {
    /// Returns the pragma value.
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Normal => "NORMAL",
        }
    }
}

/// Options applied when [`SqliteProvider`](crate::SqliteProvider) opens a file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    pub journal_mode: JournalMode,
    pub sync_mode: SyncMode,
    pub busy_timeout_ms: u64,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::default(),
            sync_mode: SyncMode::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
