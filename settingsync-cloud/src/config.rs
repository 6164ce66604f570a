//! Cloud sync configuration.

use serde::{Deserialize, Serialize};
use settingsync_crypto::KdfParams;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for the push and pull loops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum quiet period before a burst of local changes is pushed.
    pub debounce_ms: u64,

    /// Maximum number of changes in one push request.
    pub max_batch_count: usize,

    /// Soft cap on the serialized size of one push request's changes.
    pub max_batch_bytes: usize,

    /// Interval between periodic pulls (seconds).
    pub pull_interval_secs: u64,

    /// Page size requested from the relay on pull.
    pub pull_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            max_batch_count: 100,
            max_batch_bytes: 1024 * 1024, // 1 MiB
            pull_interval_secs: 300,      // 5 minutes
            pull_limit: 200,
        }
    }
}

impl SyncConfig {
    /// Replaces zero values with defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.debounce_ms == 0 {
            self.debounce_ms = defaults.debounce_ms;
        }
        if self.max_batch_count == 0 {
            self.max_batch_count = defaults.max_batch_count;
        }
        if self.max_batch_bytes == 0 {
            self.max_batch_bytes = defaults.max_batch_bytes;
        }
        if self.pull_interval_secs == 0 {
            self.pull_interval_secs = defaults.pull_interval_secs;
        }
        if self.pull_limit == 0 {
            self.pull_limit = defaults.pull_limit;
        }
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }
}

/// Configuration for the HTTP relay client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    /// Base URL of the relay (e.g., "https://sync.example.com").
    pub base_url: String,

    /// Sent as `X-App-Version` when non-empty.
    pub app_version: String,

    /// Sent as `X-Platform`. Empty means the running OS.
    pub platform: String,

    /// Upper bound on a single relay call, connect through body (seconds).
    pub request_timeout_secs: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            app_version: String::new(),
            platform: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl RelayClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_secs == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(self.request_timeout_secs)
        }
    }

    /// Platform header value, falling back to the compile-time OS name.
    pub fn resolved_platform(&self) -> String {
        let platform = self.platform.trim();
        if platform.is_empty() {
            std::env::consts::OS.to_string()
        } else {
            platform.to_string()
        }
    }
}

/// Top-level configuration for [`crate::service::SyncService`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Whether background sync may run at all.
    pub enabled: bool,

    /// Service name under which the DEK is stored in the OS credential store.
    pub keyring_service: String,

    /// File holding this installation's device id.
    pub device_id_path: PathBuf,

    pub sync: SyncConfig,

    pub relay: RelayClientConfig,

    /// KDF parameters used when a new key is initialized.
    pub kdf: KdfParams,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyring_service: "settingsync".to_string(),
            device_id_path: PathBuf::from("device_id"),
            sync: SyncConfig::default(),
            relay: RelayClientConfig::default(),
            kdf: KdfParams::default(),
        }
    }
}
