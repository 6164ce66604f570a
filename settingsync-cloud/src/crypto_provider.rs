//! Per-value encryption bound to the setting's identity.

use crate::error::{CloudError, CloudResult};
use crate::types::{EncryptedValue, Operation, ENTITY_PLUGIN_SETTING};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use settingsync_crypto::{open, seal, CryptoError, DataKey};
use std::sync::Arc;

/// Source of the DEK. Exactly one version is live at a time.
pub trait KeyProvider: Send + Sync {
    /// The current key and its version.
    fn latest_key(&self) -> CloudResult<(DataKey, i32)>;

    /// The key for `version`; [`CloudError::KeyVersionNotFound`] if it is
    /// not the one held locally.
    fn key(&self, version: i32) -> CloudResult<DataKey>;
}

/// Value cipher used by the sync loops.
pub trait SyncCrypto: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &str) -> CloudResult<EncryptedValue>;
    fn decrypt(&self, value: &EncryptedValue, aad: &str) -> CloudResult<Vec<u8>>;
}

/// AEAD cipher over keys from a [`KeyProvider`].
pub struct AeadCrypto {
    keys: Arc<dyn KeyProvider>,
}

impl AeadCrypto {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }
}

impl SyncCrypto for AeadCrypto {
    fn encrypt(&self, plaintext: &[u8], aad: &str) -> CloudResult<EncryptedValue> {
        let (key, version) = self.keys.latest_key()?;
        let sealed = seal(&key, plaintext, aad.as_bytes())?;
        Ok(EncryptedValue {
            key_version: version,
            nonce: STANDARD.encode(sealed.nonce),
            ciphertext: STANDARD.encode(sealed.ciphertext),
        })
    }

    fn decrypt(&self, value: &EncryptedValue, aad: &str) -> CloudResult<Vec<u8>> {
        let key = self.keys.key(value.key_version)?;
        let nonce = STANDARD
            .decode(&value.nonce)
            .map_err(|e| CryptoError::Encoding(format!("nonce: {e}")))?;
        let ciphertext = STANDARD
            .decode(&value.ciphertext)
            .map_err(|e| CryptoError::Encoding(format!("ciphertext: {e}")))?;
        open(&key, &nonce, &ciphertext, aad.as_bytes()).map_err(CloudError::from)
    }
}

/// Additional authenticated data for one setting change:
/// `entity_type:plugin_id:key:op`.
pub fn build_aad(entity_type: &str, plugin_id: &str, key: &str, op: Operation) -> String {
    format!("{entity_type}:{plugin_id}:{key}:{op}")
}

/// Wire `plugin_id` for an oplog entity: the entity id for plugin settings,
/// empty otherwise.
pub fn plugin_id_for(entity_type: &str, entity_id: &str) -> String {
    if entity_type == ENTITY_PLUGIN_SETTING {
        entity_id.to_string()
    } else {
        String::new()
    }
}
