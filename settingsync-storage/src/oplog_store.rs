//! Append-only oplog of local setting changes.

use crate::error::{StorageError, StorageResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// Kind of change recorded in the oplog and carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(Operation::Upsert),
            "delete" => Ok(Operation::Delete),
            other => Err(StorageError::InvalidData(format!("unknown oplog op: {other}"))),
        }
    }
}

/// A persisted oplog row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub id: i64,
    pub entity_type: String,
    /// Plugin id for plugin settings, empty for global settings.
    pub entity_id: String,
    pub key: String,
    pub operation: Operation,
    /// Plaintext value; empty for deletes.
    pub value: String,
    /// Client timestamp in Unix milliseconds.
    pub timestamp: i64,
    pub synced: bool,
}

/// Input for [`SqliteOplogStore::append`].
#[derive(Clone, Debug)]
pub struct NewOplogEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub key: String,
    pub operation: Operation,
    pub value: String,
    pub timestamp: i64,
}

/// Coalescing change signal.
///
/// Behaves like a channel of capacity one with a non-blocking send: any
/// number of `notify` calls before the listener wakes collapse into a
/// single wakeup.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    inner: Arc<Notify>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals a change. Never blocks.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Waits for the next change signal.
    pub async fn changed(&self) {
        self.inner.notified().await;
    }
}

/// SQLite-backed oplog.
#[derive(Clone)]
pub struct SqliteOplogStore {
    conn: Arc<Mutex<Connection>>,
    notifier: ChangeNotifier,
}

impl SqliteOplogStore {
    /// Opens or creates an oplog at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_connection(path)?;
        initialize_oplog_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier: ChangeNotifier::new(),
        })
    }

    /// Opens an in-memory oplog (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_oplog_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notifier: ChangeNotifier::new(),
        })
    }

    /// The signal fired after every successful append.
    pub fn notifier(&self) -> ChangeNotifier {
        self.notifier.clone()
    }

    /// Appends a change and returns its id.
    pub fn append(&self, entry: &NewOplogEntry) -> StorageResult<i64> {
        let id = {
            let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            conn.execute(
                "INSERT INTO oplog (entity_type, entity_id, key, operation, value, timestamp, synced) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    entry.entity_type,
                    entry.entity_id,
                    entry.key,
                    entry.operation.as_str(),
                    entry.value,
                    entry.timestamp,
                ],
            )?;
            conn.last_insert_rowid()
        };
        debug!("oplog append id={id} entity={} key={}", entry.entity_type, entry.key);
        self.notifier.notify();
        Ok(id)
    }

    /// Loads up to `limit` unsynced entries, oldest first.
    pub fn load_pending(&self, limit: usize) -> StorageResult<Vec<OplogEntry>> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, key, operation, value, timestamp, synced \
             FROM oplog WHERE synced = 0 ORDER BY id ASC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, entity_type, entity_id, key, op, value, timestamp, synced) = row?;
            entries.push(OplogEntry {
                id,
                entity_type,
                entity_id,
                key,
                operation: op.parse()?,
                value,
                timestamp,
                synced,
            });
        }
        Ok(entries)
    }

    /// Flags the given entries as synced in one transaction.
    pub fn mark_synced(&self, ids: &[i64]) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE oplog SET synced = 1 WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of entries not yet synced.
    pub fn pending_count(&self) -> StorageResult<u64> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM oplog WHERE synced = 0", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn initialize_oplog_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS oplog (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT    NOT NULL,
            entity_id   TEXT    NOT NULL DEFAULT '',
            key         TEXT    NOT NULL,
            operation   TEXT    NOT NULL,
            value       TEXT    NOT NULL DEFAULT '',
            timestamp   INTEGER NOT NULL,
            synced      INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_oplog_pending ON oplog(synced, id);
        "#,
    )?;
    Ok(())
}
