//! Wire types for the relay protocol and status reporting.
//!
//! Field names match the relay's JSON exactly; do not rename.

use serde::{Deserialize, Serialize};
use settingsync_crypto::KdfParams;
use settingsync_storage::SyncState;

pub use settingsync_storage::Operation;

/// Entity type for global application settings.
pub const ENTITY_WOX_SETTING: &str = "wox_setting";

/// Entity type for per-plugin settings; `plugin_id` is set.
pub const ENTITY_PLUGIN_SETTING: &str = "plugin_setting";

/// An AEAD-encrypted setting value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub key_version: i32,
    /// Base64 nonce, unique per encryption.
    pub nonce: String,
    /// Base64 ciphertext including the authentication tag.
    pub ciphertext: String,
}

/// One outbound change in a push request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Fresh per attempt; re-delivery after a crash gets a new id.
    pub change_id: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_id: String,
    pub key: String,
    pub op: Operation,
    pub client_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<EncryptedValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub changes: Vec<Change>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub change_id: String,
    pub status: String,
    #[serde(default)]
    pub server_ts: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub server_ts: i64,
    #[serde(default)]
    pub applied: Vec<AppliedChange>,
    #[serde(default)]
    pub next_cursor: String,
}

/// Request body for both `/pull` and `/snapshot`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub device_id: String,
    pub cursor: String,
    pub limit: u32,
}

/// One inbound record from the relay's change stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_id: String,
    pub key: String,
    pub op: Operation,
    #[serde(default)]
    pub server_ts: i64,
    #[serde(default)]
    pub client_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<EncryptedValue>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub next_cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

// ── Key management ──

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyInitRequest {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_name: String,
    pub kdf: KdfParams,
    pub encrypted_dek: String,
    pub key_version: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyInitResponse {
    #[serde(default)]
    pub key_version: i32,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFetchRequest {
    pub device_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFetchResponse {
    pub key_version: i32,
    pub kdf: KdfParams,
    pub encrypted_dek: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyResetPrepareRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyResetPrepareResponse {
    pub reset_token: String,
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyResetRequest {
    pub reset_token: String,
    pub confirm: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyResetResponse {
    #[serde(default)]
    pub reset_at: i64,
}

// ── Results and status ──

/// Outcome of bootstrapping a new key on this device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyInitResult {
    pub key_version: i32,
    pub created_at: i64,
}

/// Outcome of restoring an existing key onto this device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyFetchResult {
    pub key_version: i32,
}

/// Whether this device currently holds a usable DEK.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub available: bool,
    pub version: i32,
}

/// Snapshot of sync health for a UI.
#[derive(Clone, Debug, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub device_id: String,
    pub key_status: KeyStatus,
    pub state: SyncState,
}
