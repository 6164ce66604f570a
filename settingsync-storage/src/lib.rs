//! SQLite storage layer for settingsync.
//!
//! # Architecture
//!
//! - `sync_state` holds exactly one row of sync progress (cursor, timestamps,
//!   backoff, last error, bootstrap flag). All read-modify-write goes through
//!   [`SyncStateStore::update`] under a single lock.
//! - `oplog` is the append-only log of local setting changes. Rows are only
//!   ever appended or flagged as synced; values are never rewritten.
//!
//! Both stores are synchronous and cheap to clone (shared connection).

mod error;
mod oplog_store;
mod state_store;

pub use error::{StorageError, StorageResult};
pub use oplog_store::{ChangeNotifier, NewOplogEntry, OplogEntry, Operation, SqliteOplogStore};
pub use state_store::{SyncState, SyncStateStore};

use rusqlite::Connection;
use std::path::Path;

/// Opens a SQLite connection with the pragmas both stores expect.
pub(crate) fn open_connection(path: &Path) -> StorageResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
