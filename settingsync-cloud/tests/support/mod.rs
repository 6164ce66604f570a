//! In-memory relay, key server, and applier fakes shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use settingsync_cloud::api_client::{KeyClient, RelayClient};
use settingsync_cloud::collaborators::{Applier, StaticExclusionProvider};
use settingsync_cloud::crypto_provider::{build_aad, AeadCrypto, KeyProvider, SyncCrypto};
use settingsync_cloud::device::StaticDeviceProvider;
use settingsync_cloud::error::{CloudError, CloudResult};
use settingsync_cloud::sync_manager::{SyncDeps, SyncManager};
use settingsync_cloud::types::*;
use settingsync_cloud::SyncConfig;
use settingsync_crypto::{DataKey, KdfParams};
use settingsync_storage::{NewOplogEntry, SqliteOplogStore, SyncStateStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEVICE_ID: &str = "device-test-1";

/// Routes engine logs to the test output. `RUST_LOG` filters them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Argon2id parameters cheap enough for tests.
pub fn fast_kdf() -> KdfParams {
    KdfParams {
        iterations: 1,
        memory_kib: 64,
        parallelism: 1,
        ..KdfParams::default()
    }
}

// ── Keys ──

pub struct FixedKeys {
    pub dek: DataKey,
    pub version: i32,
}

impl FixedKeys {
    pub fn new() -> Self {
        Self {
            dek: DataKey::generate(),
            version: 1,
        }
    }
}

impl KeyProvider for FixedKeys {
    fn latest_key(&self) -> CloudResult<(DataKey, i32)> {
        Ok((self.dek.clone(), self.version))
    }

    fn key(&self, version: i32) -> CloudResult<DataKey> {
        if version != self.version {
            return Err(CloudError::KeyVersionNotFound(version));
        }
        Ok(self.dek.clone())
    }
}

// ── Relay ──

#[derive(Default)]
pub struct FakeRelay {
    pub pushes: Mutex<Vec<PushRequest>>,
    pub pulls: Mutex<Vec<PullRequest>>,
    pub snapshots: Mutex<Vec<PullRequest>>,
    /// Pull pages keyed by the request cursor.
    pub pages: Mutex<HashMap<String, PullResponse>>,
    pub snapshot_pages: Mutex<HashMap<String, PullResponse>>,
    pub push_status: Mutex<Option<u16>>,
    pub push_server_ts: Mutex<i64>,
    pub push_next_cursor: Mutex<String>,
}

impl FakeRelay {
    pub async fn set_page(&self, cursor: &str, records: Vec<Record>, next: &str, has_more: bool) {
        self.pages.lock().await.insert(
            cursor.to_string(),
            PullResponse {
                records,
                next_cursor: next.to_string(),
                has_more,
            },
        );
    }

    pub async fn set_snapshot_page(
        &self,
        cursor: &str,
        records: Vec<Record>,
        next: &str,
        has_more: bool,
    ) {
        self.snapshot_pages.lock().await.insert(
            cursor.to_string(),
            PullResponse {
                records,
                next_cursor: next.to_string(),
                has_more,
            },
        );
    }

    pub async fn fail_pushes_with(&self, status: Option<u16>) {
        *self.push_status.lock().await = status;
    }

    pub async fn pushed_changes(&self) -> Vec<Change> {
        self.pushes
            .lock()
            .await
            .iter()
            .flat_map(|p| p.changes.clone())
            .collect()
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    async fn push(&self, req: &PushRequest, _trace_id: &str) -> CloudResult<PushResponse> {
        if let Some(status) = *self.push_status.lock().await {
            return Err(CloudError::Api {
                status,
                body: "push rejected".into(),
            });
        }
        self.pushes.lock().await.push(req.clone());
        Ok(PushResponse {
            server_ts: *self.push_server_ts.lock().await,
            applied: req
                .changes
                .iter()
                .map(|c| AppliedChange {
                    change_id: c.change_id.clone(),
                    status: "applied".into(),
                    server_ts: 1,
                })
                .collect(),
            next_cursor: self.push_next_cursor.lock().await.clone(),
        })
    }

    async fn pull(&self, req: &PullRequest, _trace_id: &str) -> CloudResult<PullResponse> {
        self.pulls.lock().await.push(req.clone());
        self.pages
            .lock()
            .await
            .get(&req.cursor)
            .cloned()
            .ok_or(CloudError::Api {
                status: 503,
                body: format!("no page for cursor {:?}", req.cursor),
            })
    }

    async fn snapshot(&self, req: &PullRequest, _trace_id: &str) -> CloudResult<PullResponse> {
        self.snapshots.lock().await.push(req.clone());
        self.snapshot_pages
            .lock()
            .await
            .get(&req.cursor)
            .cloned()
            .ok_or(CloudError::Api {
                status: 503,
                body: "no snapshot page".into(),
            })
    }
}

// ── Key server ──

#[derive(Default)]
pub struct FakeKeyServer {
    pub record: Mutex<Option<KeyInitRequest>>,
    pub init_requests: Mutex<Vec<KeyInitRequest>>,
    pub reset_requests: Mutex<Vec<String>>,
    pub fail_init: Mutex<bool>,
    pub reply_version: Mutex<i32>,
    /// Holds back the next init response after the record is stored.
    pub init_delay: Mutex<Option<Duration>>,
}

pub const RESET_TOKEN: &str = "reset-token-1";

#[async_trait]
impl KeyClient for FakeKeyServer {
    async fn init_key(&self, req: &KeyInitRequest, _trace_id: &str) -> CloudResult<KeyInitResponse> {
        self.init_requests.lock().await.push(req.clone());
        if *self.fail_init.lock().await {
            return Err(CloudError::Api {
                status: 409,
                body: "key already exists".into(),
            });
        }
        *self.record.lock().await = Some(req.clone());
        let delay = self.init_delay.lock().await.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(KeyInitResponse {
            key_version: *self.reply_version.lock().await,
            created_at: 1_700_000_000_000,
        })
    }

    async fn fetch_key(&self, _req: &KeyFetchRequest, _trace_id: &str) -> CloudResult<KeyFetchResponse> {
        let record = self.record.lock().await.clone().ok_or(CloudError::Api {
            status: 404,
            body: "no key".into(),
        })?;
        Ok(KeyFetchResponse {
            key_version: record.key_version,
            kdf: record.kdf,
            encrypted_dek: record.encrypted_dek,
        })
    }

    async fn prepare_key_reset(&self, _trace_id: &str) -> CloudResult<KeyResetPrepareResponse> {
        Ok(KeyResetPrepareResponse {
            reset_token: RESET_TOKEN.into(),
            expires_at: 1_700_000_600_000,
        })
    }

    async fn reset_key(&self, reset_token: &str, _trace_id: &str) -> CloudResult<KeyResetResponse> {
        self.reset_requests.lock().await.push(reset_token.to_string());
        if reset_token != RESET_TOKEN {
            return Err(CloudError::Api {
                status: 403,
                body: "invalid reset token".into(),
            });
        }
        *self.record.lock().await = None;
        Ok(KeyResetResponse {
            reset_at: 1_700_000_700_000,
        })
    }
}

// ── Applier ──

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedCall {
    /// `None` for global settings.
    pub plugin_id: Option<String>,
    pub key: String,
    pub op: Operation,
    pub value: String,
}

#[derive(Default)]
pub struct RecordingApplier {
    pub calls: Mutex<Vec<AppliedCall>>,
}

impl RecordingApplier {
    pub async fn calls(&self) -> Vec<AppliedCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply_wox_setting(&self, key: &str, op: Operation, value: &str) -> CloudResult<()> {
        self.calls.lock().await.push(AppliedCall {
            plugin_id: None,
            key: key.into(),
            op,
            value: value.into(),
        });
        Ok(())
    }

    async fn apply_plugin_setting(
        &self,
        plugin_id: &str,
        key: &str,
        op: Operation,
        value: &str,
    ) -> CloudResult<()> {
        self.calls.lock().await.push(AppliedCall {
            plugin_id: Some(plugin_id.into()),
            key: key.into(),
            op,
            value: value.into(),
        });
        Ok(())
    }
}

// ── Sync harness ──

pub struct Harness {
    pub relay: Arc<FakeRelay>,
    pub oplog: SqliteOplogStore,
    pub applier: Arc<RecordingApplier>,
    pub exclusions: Arc<StaticExclusionProvider>,
    pub state: SyncStateStore,
    pub crypto: Arc<AeadCrypto>,
    pub manager: SyncManager,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        init_tracing();
        let relay = Arc::new(FakeRelay::default());
        let oplog = SqliteOplogStore::open_in_memory().unwrap();
        let applier = Arc::new(RecordingApplier::default());
        let exclusions = Arc::new(StaticExclusionProvider::default());
        let state = SyncStateStore::open_in_memory().unwrap();
        let crypto = Arc::new(AeadCrypto::new(Arc::new(FixedKeys::new())));

        let manager = SyncManager::new(
            config,
            state.clone(),
            SyncDeps {
                relay: Some(relay.clone()),
                crypto: Some(crypto.clone()),
                device: Some(Arc::new(StaticDeviceProvider::new(DEVICE_ID))),
                oplog: Some(Arc::new(oplog.clone())),
                applier: Some(applier.clone()),
                exclusions: Some(exclusions.clone()),
                notifier: Some(oplog.notifier()),
            },
        );

        Self {
            relay,
            oplog,
            applier,
            exclusions,
            state,
            crypto,
            manager,
        }
    }

    pub fn record_global(&self, key: &str, value: &str) -> i64 {
        self.oplog
            .append(&NewOplogEntry {
                entity_type: ENTITY_WOX_SETTING.into(),
                entity_id: String::new(),
                key: key.into(),
                operation: Operation::Upsert,
                value: value.into(),
                timestamp: settingsync_storage::now_millis(),
            })
            .unwrap()
    }

    pub fn record_plugin(&self, plugin_id: &str, key: &str, value: &str) -> i64 {
        self.oplog
            .append(&NewOplogEntry {
                entity_type: ENTITY_PLUGIN_SETTING.into(),
                entity_id: plugin_id.into(),
                key: key.into(),
                operation: Operation::Upsert,
                value: value.into(),
                timestamp: settingsync_storage::now_millis(),
            })
            .unwrap()
    }

    /// An inbound upsert sealed the way a peer device would seal it.
    pub fn sealed_record(&self, entity_type: &str, plugin_id: &str, key: &str, value: &str) -> Record {
        let aad = build_aad(entity_type, plugin_id, key, Operation::Upsert);
        Record {
            entity_type: entity_type.into(),
            plugin_id: plugin_id.into(),
            key: key.into(),
            op: Operation::Upsert,
            server_ts: 10,
            client_ts: 9,
            value: Some(self.crypto.encrypt(value.as_bytes(), &aad).unwrap()),
        }
    }

    /// Lifts the backoff window so the next attempt runs.
    pub fn clear_backoff(&self) {
        self.state.update(|s| s.backoff_until = 0).unwrap();
    }
}

/// Polls `check` until it holds or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
