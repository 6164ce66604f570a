//! Stable per-installation device identity.

use crate::error::{CloudError, CloudResult};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Supplies the device id sent with every relay call.
pub trait DeviceProvider: Send + Sync {
    fn device_id(&self) -> CloudResult<String>;
}

/// Device id persisted to a file.
///
/// A UUID v4 is created on first call and reused thereafter. Removing the
/// file is the only way to get a new id.
pub struct FileDeviceProvider {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl FileDeviceProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_or_create(&self) -> CloudResult<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CloudError::DeviceIdUnavailable(e.to_string())),
        }

        let id = Uuid::new_v4().to_string();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CloudError::DeviceIdUnavailable(e.to_string()))?;
            }
        }
        std::fs::write(&self.path, &id)
            .map_err(|e| CloudError::DeviceIdUnavailable(e.to_string()))?;
        info!("created device id at {}", self.path.display());
        Ok(id)
    }
}

impl DeviceProvider for FileDeviceProvider {
    fn device_id(&self) -> CloudResult<String> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CloudError::DeviceIdUnavailable("lock poisoned".into()))?;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let id = self.load_or_create()?;
        *cached = Some(id.clone());
        Ok(id)
    }
}

/// Fixed device id, for embedding and tests.
#[derive(Clone, Debug)]
pub struct StaticDeviceProvider(String);

impl StaticDeviceProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl DeviceProvider for StaticDeviceProvider {
    fn device_id(&self) -> CloudResult<String> {
        if self.0.is_empty() {
            return Err(CloudError::DeviceIdUnavailable("empty device id".into()));
        }
        Ok(self.0.clone())
    }
}

/// Host name for key registration, with a fixed fallback.
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "settingsync-device".to_string())
}
