//! Capabilities the sync manager consumes from the host application.

use crate::error::{CloudError, CloudResult};
use async_trait::async_trait;
use settingsync_storage::{OplogEntry, Operation, SqliteOplogStore};
use std::collections::HashSet;
use std::sync::RwLock;

/// Source of local changes to push.
#[async_trait]
pub trait OplogStore: Send + Sync {
    /// Unsynced entries, oldest first, at most `limit`.
    async fn load_pending(&self, limit: usize) -> CloudResult<Vec<OplogEntry>>;

    async fn mark_synced(&self, ids: &[i64]) -> CloudResult<()>;
}

#[async_trait]
impl OplogStore for SqliteOplogStore {
    async fn load_pending(&self, limit: usize) -> CloudResult<Vec<OplogEntry>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_pending(limit))
            .await
            .map_err(|e| CloudError::Oplog(e.to_string()))?
            .map_err(CloudError::from)
    }

    async fn mark_synced(&self, ids: &[i64]) -> CloudResult<()> {
        let store = self.clone();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || store.mark_synced(&ids))
            .await
            .map_err(|e| CloudError::Oplog(e.to_string()))?
            .map_err(CloudError::from)
    }
}

/// Writes pulled settings into the local settings store.
///
/// `value` is the decrypted plaintext for upserts and empty for deletes.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply_wox_setting(&self, key: &str, op: Operation, value: &str) -> CloudResult<()>;

    async fn apply_plugin_setting(
        &self,
        plugin_id: &str,
        key: &str,
        op: Operation,
        value: &str,
    ) -> CloudResult<()>;
}

/// Plugins whose settings are neither pushed nor applied.
pub trait ExclusionProvider: Send + Sync {
    fn disabled_plugin_ids(&self) -> Vec<String>;
}

/// Exclusion list held in memory and replaceable at runtime.
#[derive(Default)]
pub struct StaticExclusionProvider {
    ids: RwLock<HashSet<String>>,
}

impl StaticExclusionProvider {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut guard) = self.ids.write() {
            *guard = ids.into_iter().map(Into::into).collect();
        }
    }
}

impl ExclusionProvider for StaticExclusionProvider {
    fn disabled_plugin_ids(&self) -> Vec<String> {
        self.ids
            .read()
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}
