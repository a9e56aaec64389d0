//! Sync settings persisted inside the vault.
//!
//! Stored as camelCase JSON at `.sync/config.json`. Missing fields take
//! defaults. The passphrase and derived key are never stored here.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_core::crypto::KdfParams;
use sync_core::fs::{FileSystem, FsError};
use sync_core::rules::{ExcludeConfig, SYNC_DIR};
use sync_core::vault_id::VaultId;
use thiserror::Error;

/// Vault-relative path of the settings file.
pub const SETTINGS_PATH: &str = ".sync/config.json";

/// Environment variable the CLI reads the passphrase from.
pub const PASSPHRASE_ENV: &str = "VAULT_SYNC_PASSPHRASE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access settings: {0}")]
    Fs(#[from] FsError),

    #[error("Invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("batchSize must be at least 1")]
    InvalidBatchSize,
}

/// What happens to a local file deleted on another device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Remove the file
    #[default]
    Remove,
    /// Move it under `.trash/`
    Trash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Set by `init` or `join`
    #[serde(default)]
    pub vault_id: Option<VaultId>,

    #[serde(default)]
    pub relay_url: Option<String>,

    #[serde(default)]
    pub exclude: ExcludeConfig,

    /// Concurrent transfers per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub delete_mode: DeleteMode,

    #[serde(default)]
    pub auto_sync_interval_secs: Option<u64>,

    /// Must match across every device of the vault
    #[serde(default)]
    pub kdf: KdfParams,

    #[serde(default)]
    pub timing: TimingConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            vault_id: None,
            relay_url: None,
            exclude: ExcludeConfig::default(),
            batch_size: default_batch_size(),
            delete_mode: DeleteMode::default(),
            auto_sync_interval_secs: None,
            kdf: KdfParams::default(),
            timing: TimingConfig::default(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}

impl SyncSettings {
    /// Load settings from the vault. A missing file yields defaults.
    pub async fn load<F: FileSystem + ?Sized>(fs: &F) -> Result<Self, ConfigError> {
        let bytes = match fs.read(SETTINGS_PATH).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let settings: Self = serde_json::from_slice(&bytes)?;
        settings.validate()?;
        Ok(settings)
    }

    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F) -> Result<(), ConfigError> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self)?;
        fs.mkdir(SYNC_DIR).await?;
        fs.write(SETTINGS_PATH, &json).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }
}

/// Timeouts and delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingConfig {
    pub connect_timeout_ms: u64,
    pub manifest_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// How long `done` is shown before relaxing to `idle`
    pub done_relax_ms: u64,
    /// Window for coalescing relay change notifications
    pub notify_debounce_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            manifest_timeout_ms: 15_000,
            download_timeout_ms: 30_000,
            ack_timeout_ms: 30_000,
            done_relax_ms: 3_000,
            notify_debounce_ms: 2_000,
        }
    }
}

impl TimingConfig {
    pub fn done_relax(&self) -> Duration {
        Duration::from_millis(self.done_relax_ms)
    }

    pub fn notify_debounce(&self) -> Duration {
        Duration::from_millis(self.notify_debounce_ms)
    }
}
