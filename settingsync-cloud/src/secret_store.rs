//! Secure local storage for the unwrapped DEK.

use crate::error::{CloudError, CloudResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Minimal secret store. `get` on a missing entry returns
/// [`CloudError::KeyNotFound`].
pub trait KeyringStore: Send + Sync {
    fn get(&self, key: &str) -> CloudResult<String>;
    fn set(&self, key: &str, value: &str) -> CloudResult<()>;
    /// Removing a missing entry is not an error.
    fn delete(&self, key: &str) -> CloudResult<()>;
}

/// Platform credential store (Keychain, Credential Manager, Secret Service).
pub struct OsKeyringStore {
    service: String,
}

impl OsKeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> CloudResult<::keyring::Entry> {
        ::keyring::Entry::new(&self.service, key).map_err(|e| CloudError::Keyring(e.to_string()))
    }
}

impl KeyringStore for OsKeyringStore {
    fn get(&self, key: &str) -> CloudResult<String> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(value),
            Err(::keyring::Error::NoEntry) => Err(CloudError::KeyNotFound),
            Err(e) => Err(CloudError::Keyring(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> CloudResult<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| CloudError::Keyring(e.to_string()))
    }

    fn delete(&self, key: &str) -> CloudResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(::keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CloudError::Keyring(e.to_string())),
        }
    }
}

/// Process-local store, for tests and headless hosts.
#[derive(Default)]
pub struct MemoryKeyringStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyringStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CloudResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| CloudError::Keyring("lock poisoned".into()))
    }
}

impl KeyringStore for MemoryKeyringStore {
    fn get(&self, key: &str) -> CloudResult<String> {
        self.lock()?.get(key).cloned().ok_or(CloudError::KeyNotFound)
    }

    fn set(&self, key: &str, value: &str) -> CloudResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> CloudResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
