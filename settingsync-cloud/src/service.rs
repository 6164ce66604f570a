//! Application-facing sync context.
//!
//! [`SyncService`] owns the key manager and sync manager for one process and
//! wires them together: the sync manager observes the key manager, so a
//! successful init or restore starts background sync and a reset stops it.
//! Hosts construct one and pass it to whatever needs it.

use crate::api_client::{AuthProvider, HttpRelayClient, KeyClient, RelayClient};
use crate::collaborators::{Applier, ExclusionProvider, OplogStore};
use crate::config::ServiceConfig;
use crate::crypto_provider::{AeadCrypto, KeyProvider};
use crate::device::{DeviceProvider, FileDeviceProvider};
use crate::error::CloudResult;
use crate::key_manager::{KeyManager, KeyObserver};
use crate::secret_store::{KeyringStore, OsKeyringStore};
use crate::sync_manager::{SyncDeps, SyncManager};
use crate::types::{
    KeyFetchResult, KeyInitResult, KeyResetPrepareResponse, KeyResetResponse, KeyStatus,
    SyncStatus,
};
use settingsync_storage::{ChangeNotifier, SqliteOplogStore, SyncStateStore};
use std::sync::Arc;
use tracing::info;

/// Everything the service needs from outside.
pub struct ServiceDeps {
    pub relay: Arc<dyn RelayClient>,
    pub key_client: Arc<dyn KeyClient>,
    pub device: Arc<dyn DeviceProvider>,
    pub keyring: Arc<dyn KeyringStore>,
    pub oplog: Arc<dyn OplogStore>,
    pub applier: Arc<dyn Applier>,
    pub exclusions: Option<Arc<dyn ExclusionProvider>>,
    pub notifier: Option<ChangeNotifier>,
}

pub struct SyncService {
    config: ServiceConfig,
    device: Arc<dyn DeviceProvider>,
    keys: Arc<KeyManager>,
    manager: Arc<SyncManager>,
}

impl SyncService {
    pub fn new(config: ServiceConfig, state: SyncStateStore, deps: ServiceDeps) -> Self {
        let keys = Arc::new(
            KeyManager::new(deps.keyring, state.clone())
                .with_client(deps.key_client)
                .with_device_provider(deps.device.clone())
                .with_kdf_params(config.kdf.clone()),
        );
        let key_provider: Arc<dyn KeyProvider> = keys.clone();

        let manager = Arc::new(SyncManager::new(
            config.sync.clone(),
            state,
            SyncDeps {
                relay: Some(deps.relay),
                crypto: Some(Arc::new(AeadCrypto::new(key_provider))),
                device: Some(deps.device.clone()),
                oplog: Some(deps.oplog),
                applier: Some(deps.applier),
                exclusions: deps.exclusions,
                notifier: deps.notifier,
            },
        ));

        if config.enabled {
            let observer: Arc<dyn KeyObserver> = manager.clone();
            keys.subscribe(Arc::downgrade(&observer));
        }

        Self {
            config,
            device: deps.device,
            keys,
            manager,
        }
    }

    /// Production wiring: HTTP relay, OS keyring, file-backed device id,
    /// and the SQLite oplog's own change notifier.
    pub fn open(
        config: ServiceConfig,
        state: SyncStateStore,
        oplog: SqliteOplogStore,
        applier: Arc<dyn Applier>,
        exclusions: Option<Arc<dyn ExclusionProvider>>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> CloudResult<Self> {
        let device: Arc<dyn DeviceProvider> =
            Arc::new(FileDeviceProvider::new(&config.device_id_path));
        let client = Arc::new(HttpRelayClient::new(&config.relay, device.clone(), auth)?);
        let keyring = Arc::new(OsKeyringStore::new(&config.keyring_service));
        let notifier = oplog.notifier();

        let deps = ServiceDeps {
            relay: client.clone(),
            key_client: client,
            device,
            keyring,
            oplog: Arc::new(oplog),
            applier,
            exclusions,
            notifier: Some(notifier),
        };
        Ok(Self::new(config, state, deps))
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Starts background sync if enabled and a key is present. Without a
    /// key, sync starts later when one is initialized or restored.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("cloud sync disabled");
            return;
        }
        if !self.keys.status().available {
            info!("cloud sync waiting for a recovery code");
            return;
        }
        self.manager.start().await;
    }

    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    pub async fn push_now(&self) {
        self.manager.push_pending().await;
    }

    pub async fn pull_now(&self) {
        self.manager.pull().await;
    }

    pub async fn resync_from_snapshot(&self, reason: &str) {
        self.manager.resync_from_snapshot(reason).await;
    }

    pub async fn init_with_recovery_code(
        &self,
        recovery_code: &str,
        device_name: Option<&str>,
    ) -> CloudResult<KeyInitResult> {
        self.keys
            .init_with_recovery_code(recovery_code, device_name)
            .await
    }

    pub async fn fetch_with_recovery_code(&self, recovery_code: &str) -> CloudResult<KeyFetchResult> {
        self.keys.fetch_with_recovery_code(recovery_code).await
    }

    pub async fn prepare_key_reset(&self) -> CloudResult<KeyResetPrepareResponse> {
        self.keys.prepare_reset().await
    }

    pub async fn reset_key(&self, reset_token: &str) -> CloudResult<KeyResetResponse> {
        self.keys.reset(reset_token).await
    }

    pub fn key_status(&self) -> KeyStatus {
        self.keys.status()
    }

    pub fn status(&self) -> CloudResult<SyncStatus> {
        Ok(SyncStatus {
            enabled: self.config.enabled,
            device_id: self.device.device_id().unwrap_or_default(),
            key_status: self.keys.status(),
            state: self.manager.state()?,
        })
    }
}
