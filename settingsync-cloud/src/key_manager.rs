//! DEK lifecycle: bootstrap, restore, and two-phase reset.
//!
//! The DEK is generated on the first device, wrapped under a KEK derived
//! from the user's recovery code, and uploaded only in wrapped form. Other
//! devices fetch the wrapped blob and unwrap it with the same code. The
//! unwrapped DEK lives only in the local [`KeyringStore`].

use crate::api_client::{new_trace_id, KeyClient};
use crate::crypto_provider::KeyProvider;
use crate::device::{default_device_name, DeviceProvider};
use crate::error::{CloudError, CloudResult};
use crate::secret_store::KeyringStore;
use crate::types::{
    KeyFetchRequest, KeyFetchResult, KeyInitRequest, KeyInitResult, KeyResetPrepareResponse,
    KeyResetResponse, KeyStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use settingsync_crypto::{derive_kek, unwrap_key, wrap_key, CryptoError, DataKey, KdfParams};
use settingsync_storage::SyncStateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{info, warn};

/// Keyring entry holding the serialized [`StoredKey`].
pub const DEK_ENTRY: &str = "dek";

/// Version sent with a fresh key and assumed when the relay omits one.
pub const INITIAL_KEY_VERSION: i32 = 1;

/// Notified when a usable key appears or disappears.
#[async_trait]
pub trait KeyObserver: Send + Sync {
    async fn key_ready(&self, version: i32);
    async fn key_cleared(&self);
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    version: i32,
    dek: String,
}

pub struct KeyManager {
    client: Option<Arc<dyn KeyClient>>,
    device: Option<Arc<dyn DeviceProvider>>,
    keyring: Arc<dyn KeyringStore>,
    state: SyncStateStore,
    kdf: KdfParams,
    /// Serializes init, fetch, and reset so the stored key always matches
    /// the last relay acknowledgment.
    ops: tokio::sync::Mutex<()>,
    cached: Mutex<Option<(DataKey, i32)>>,
    /// Set by a confirmed reset; hides any key the keyring failed to drop.
    revoked: AtomicBool,
    observers: RwLock<Vec<Weak<dyn KeyObserver>>>,
}

impl KeyManager {
    pub fn new(keyring: Arc<dyn KeyringStore>, state: SyncStateStore) -> Self {
        Self {
            client: None,
            device: None,
            keyring,
            state,
            kdf: KdfParams::default(),
            ops: tokio::sync::Mutex::new(()),
            cached: Mutex::new(None),
            revoked: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn with_client(mut self, client: Arc<dyn KeyClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_device_provider(mut self, device: Arc<dyn DeviceProvider>) -> Self {
        self.device = Some(device);
        self
    }

    /// KDF parameters for new keys. A fresh salt is drawn on every init.
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Registers an observer. Dropped observers are skipped.
    pub fn subscribe(&self, observer: Weak<dyn KeyObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    // ── Bootstrap / restore ──

    /// Creates a new DEK, registers its wrapped form with the relay, and
    /// stores it locally once the relay has accepted it.
    pub async fn init_with_recovery_code(
        &self,
        recovery_code: &str,
        device_name: Option<&str>,
    ) -> CloudResult<KeyInitResult> {
        let client = self.client()?;
        let ops = self.ops.lock().await;
        let device_id = self.device()?.device_id()?;

        let dek = DataKey::generate();
        let kdf = self.kdf.with_random_salt();
        let kek = derive_kek_blocking(recovery_code, &kdf).await?;
        let encrypted_dek = wrap_key(&kek, &dek)?;

        let device_name = device_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(default_device_name);

        let req = KeyInitRequest {
            device_id,
            device_name,
            kdf,
            encrypted_dek,
            key_version: INITIAL_KEY_VERSION,
        };
        let resp = client.init_key(&req, &new_trace_id()).await?;

        let version = effective_version(resp.key_version);
        self.store_key(version, &dek)?;
        self.state.update(|s| s.bootstrapped = true)?;
        drop(ops);
        info!(key_version = version, "sync key initialized");

        self.notify_ready(version).await;
        Ok(KeyInitResult {
            key_version: version,
            created_at: resp.created_at,
        })
    }

    /// Restores the DEK registered by another device.
    pub async fn fetch_with_recovery_code(&self, recovery_code: &str) -> CloudResult<KeyFetchResult> {
        let client = self.client()?;
        let ops = self.ops.lock().await;
        let device_id = self.device()?.device_id()?;

        let resp = client
            .fetch_key(&KeyFetchRequest { device_id }, &new_trace_id())
            .await?;

        let kek = derive_kek_blocking(recovery_code, &resp.kdf).await?;
        let dek = unwrap_key(&kek, &resp.encrypted_dek)?;

        let version = effective_version(resp.key_version);
        self.store_key(version, &dek)?;
        self.state.update(|s| s.bootstrapped = true)?;
        drop(ops);
        info!(key_version = version, "sync key restored");

        self.notify_ready(version).await;
        Ok(KeyFetchResult {
            key_version: version,
        })
    }

    // ── Reset ──

    /// First phase of a reset: asks the relay for a short-lived token.
    pub async fn prepare_reset(&self) -> CloudResult<KeyResetPrepareResponse> {
        self.client()?.prepare_key_reset(&new_trace_id()).await
    }

    /// Second phase: invalidates the relay's key record and forgets the
    /// local key.
    ///
    /// Once the relay confirms, the key is unusable in this process even if
    /// removing it from the keyring fails; that failure is still returned.
    pub async fn reset(&self, reset_token: &str) -> CloudResult<KeyResetResponse> {
        let client = self.client()?;
        let reset_token = reset_token.trim();
        if reset_token.is_empty() {
            return Err(CloudError::Config("reset token is empty".into()));
        }

        let ops = self.ops.lock().await;
        let resp = client.reset_key(reset_token, &new_trace_id()).await?;

        self.revoked.store(true, Ordering::SeqCst);
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
        let deleted = self.keyring.delete(DEK_ENTRY);
        let unflagged = self.state.update(|s| s.bootstrapped = false);
        drop(ops);

        match &deleted {
            Ok(()) => info!("sync key reset"),
            Err(e) => warn!("sync key reset, but removing it locally failed: {e}"),
        }
        self.notify_cleared().await;

        deleted?;
        unflagged?;
        Ok(resp)
    }

    pub fn status(&self) -> KeyStatus {
        match self.load_key() {
            Ok((_, version)) => KeyStatus {
                available: true,
                version,
            },
            Err(_) => KeyStatus::default(),
        }
    }

    // ── Local key material ──

    fn store_key(&self, version: i32, dek: &DataKey) -> CloudResult<()> {
        let stored = StoredKey {
            version,
            dek: dek.to_base64(),
        };
        self.keyring
            .set(DEK_ENTRY, &serde_json::to_string(&stored)?)?;
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((dek.clone(), version));
        }
        self.revoked.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn load_key(&self) -> CloudResult<(DataKey, i32)> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(CloudError::KeyNotFound);
        }
        if let Ok(cached) = self.cached.lock() {
            if let Some(hit) = cached.as_ref() {
                return Ok(hit.clone());
            }
        }

        let raw = self.keyring.get(DEK_ENTRY)?;
        let stored: StoredKey = serde_json::from_str(&raw)?;
        let dek = DataKey::from_base64(&stored.dek)?;

        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((dek.clone(), stored.version));
        }
        Ok((dek, stored.version))
    }

    fn client(&self) -> CloudResult<&Arc<dyn KeyClient>> {
        self.client.as_ref().ok_or(CloudError::NotConfigured("key client"))
    }

    fn device(&self) -> CloudResult<&Arc<dyn DeviceProvider>> {
        self.device
            .as_ref()
            .ok_or(CloudError::NotConfigured("device provider"))
    }

    fn live_observers(&self) -> Vec<Arc<dyn KeyObserver>> {
        match self.observers.read() {
            Ok(observers) => observers.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => {
                warn!("key observer list poisoned");
                Vec::new()
            }
        }
    }

    async fn notify_ready(&self, version: i32) {
        for observer in self.live_observers() {
            observer.key_ready(version).await;
        }
    }

    async fn notify_cleared(&self) {
        for observer in self.live_observers() {
            observer.key_cleared().await;
        }
    }
}

impl KeyProvider for KeyManager {
    fn latest_key(&self) -> CloudResult<(DataKey, i32)> {
        self.load_key()
    }

    fn key(&self, version: i32) -> CloudResult<DataKey> {
        let (dek, held) = self.load_key()?;
        if held != version {
            return Err(CloudError::KeyVersionNotFound(version));
        }
        Ok(dek)
    }
}

fn effective_version(version: i32) -> i32 {
    if version == 0 { INITIAL_KEY_VERSION } else { version }
}

/// Runs Argon2id on the blocking pool.
async fn derive_kek_blocking(recovery_code: &str, kdf: &KdfParams) -> CloudResult<DataKey> {
    let code = recovery_code.to_string();
    let kdf = kdf.clone();
    tokio::task::spawn_blocking(move || derive_kek(&code, &kdf))
        .await
        .map_err(|e| CryptoError::KeyDerivation(format!("derivation task failed: {e}")))?
        .map_err(CloudError::from)
}
