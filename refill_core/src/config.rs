//! Configuration file support for Refill.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/refill/config.toml`.

use crate::{Error, IntervalUnit, ReminderPreferences, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub reminders: ReminderDefaults,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl DataConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("prescriptions.json")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("notifications.jsonl")
    }
}

/// Reminder preferences applied when the caller leaves them out
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReminderDefaults {
    #[serde(default = "default_primary_offset")]
    pub primary_offset: i64,

    #[serde(default = "default_unit")]
    pub primary_unit: IntervalUnit,

    #[serde(default = "default_secondary_count")]
    pub secondary_count: u32,

    #[serde(default = "default_secondary_every")]
    pub secondary_every: i64,

    #[serde(default = "default_unit")]
    pub secondary_unit: IntervalUnit,
}

impl Default for ReminderDefaults {
    fn default() -> Self {
        Self {
            primary_offset: default_primary_offset(),
            primary_unit: default_unit(),
            secondary_count: default_secondary_count(),
            secondary_every: default_secondary_every(),
            secondary_unit: default_unit(),
        }
    }
}

impl ReminderDefaults {
    pub fn preferences(&self) -> Result<ReminderPreferences> {
        ReminderPreferences::from_units(
            self.primary_offset,
            self.primary_unit,
            self.secondary_count,
            Some((self.secondary_every, self.secondary_unit)),
        )
        .map_err(|e| Error::Config(format!("[reminders]: {}", e)))
    }
}

/// What to do with plan entries that are already due at registration time
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PastDuePolicy {
    /// Collapse all past-due entries into one notification fired right away
    FireNow,
    /// Drop them
    Skip,
}

/// Notification dispatcher interaction
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Extra attempts at confirming a cancellation before giving up
    #[serde(default = "default_cancel_retries")]
    pub cancel_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_past_due")]
    pub past_due: PastDuePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cancel_retries: default_cancel_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            past_due: default_past_due(),
        }
    }
}

impl DispatchConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("refill")
}

fn default_primary_offset() -> i64 {
    1
}

fn default_unit() -> IntervalUnit {
    IntervalUnit::Days
}

fn default_secondary_count() -> u32 {
    1
}

fn default_secondary_every() -> i64 {
    1
}

fn default_cancel_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_past_due() -> PastDuePolicy {
    PastDuePolicy::FireNow
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject settings that would make every add fail
    pub fn validate(&self) -> Result<()> {
        self.reminders.preferences().map(|_| ())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("refill").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
