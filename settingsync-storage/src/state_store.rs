//! Durable single-row sync progress record.

use crate::error::{StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Sync progress, persisted after every state-changing operation.
///
/// Timestamps are Unix milliseconds; `0` means "never".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Opaque server cursor for the pull stream.
    pub cursor: String,
    pub last_pull_ts: i64,
    pub last_push_ts: i64,
    /// No push or pull is attempted before this instant.
    pub backoff_until: i64,
    pub retry_count: u32,
    pub last_error: String,
    pub bootstrapped: bool,
}

impl SyncState {
    /// Returns true while the shared backoff window is open at `now_ms`.
    pub fn is_backing_off(&self, now_ms: i64) -> bool {
        self.backoff_until > now_ms
    }
}

/// SQLite-backed store for the singleton [`SyncState`] row.
///
/// The connection mutex doubles as the process-wide state lock: `update`
/// holds it across load, mutate, and save.
#[derive(Clone)]
pub struct SyncStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SyncStateStore {
    /// Opens or creates a state store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_connection(path)?;
        initialize_state_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory state store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_state_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Loads the state, creating the default row on first use.
    pub fn load(&self) -> StorageResult<SyncState> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        load_row(&conn)
    }

    /// Overwrites the state row.
    pub fn save(&self, state: &SyncState) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        save_row(&conn, state)
    }

    /// Atomically loads, mutates, and saves the state. Returns the saved value.
    pub fn update<F>(&self, mutate: F) -> StorageResult<SyncState>
    where
        F: FnOnce(&mut SyncState),
    {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut state = load_row(&conn)?;
        mutate(&mut state);
        save_row(&conn, &state)?;
        Ok(state)
    }
}

fn initialize_state_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            cursor          TEXT    NOT NULL DEFAULT '',
            last_pull_ts    INTEGER NOT NULL DEFAULT 0,
            last_push_ts    INTEGER NOT NULL DEFAULT 0,
            backoff_until   INTEGER NOT NULL DEFAULT 0,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT    NOT NULL DEFAULT '',
            bootstrapped    INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;
    Ok(())
}

fn load_row(conn: &Connection) -> StorageResult<SyncState> {
    let existing = conn
        .query_row(
            "SELECT cursor, last_pull_ts, last_push_ts, backoff_until, retry_count, last_error, bootstrapped \
             FROM sync_state WHERE id = 1",
            [],
            |row| {
                Ok(SyncState {
                    cursor: row.get(0)?,
                    last_pull_ts: row.get(1)?,
                    last_push_ts: row.get(2)?,
                    backoff_until: row.get(3)?,
                    retry_count: row.get(4)?,
                    last_error: row.get(5)?,
                    bootstrapped: row.get(6)?,
                })
            },
        )
        .optional()?;

    match existing {
        Some(state) => Ok(state),
        None => {
            conn.execute("INSERT OR IGNORE INTO sync_state (id) VALUES (1)", [])?;
            Ok(SyncState::default())
        }
    }
}

fn save_row(conn: &Connection, state: &SyncState) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO sync_state (
            id, cursor, last_pull_ts, last_push_ts, backoff_until,
            retry_count, last_error, bootstrapped
        ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            cursor = excluded.cursor,
            last_pull_ts = excluded.last_pull_ts,
            last_push_ts = excluded.last_push_ts,
            backoff_until = excluded.backoff_until,
            retry_count = excluded.retry_count,
            last_error = excluded.last_error,
            bootstrapped = excluded.bootstrapped
        "#,
        params![
            state.cursor,
            state.last_pull_ts,
            state.last_push_ts,
            state.backoff_until,
            state.retry_count,
            state.last_error,
            state.bootstrapped,
        ],
    )?;
    Ok(())
}
