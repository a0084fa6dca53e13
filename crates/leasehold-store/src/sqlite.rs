use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use tracing::info;

use crate::db::init_db;
use crate::error::Result;
use crate::types::{ts_from_db, Lease, WorkRecord, WorkStatus};

/// SQLite-backed [`LeaseStore`](crate::LeaseStore) and
/// [`WorkStore`](crate::WorkStore).
///
/// Wraps one connection in a `Mutex`; every operation is a short synchronous
/// statement or `IMMEDIATE` transaction, so the lock is never held across an
/// await. Several processes coordinate by opening the same file, each with
/// its own `SqliteStore`.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) a database file shared with other nodes.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "opened SQLite store");
        Self::new(conn)
    }

    /// Private in-memory database; only useful within one process.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.db.lock().unwrap();
        f(&mut conn)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

pub(crate) const WORK_COLUMNS: &str = "id, work_type, payload, payload_type, payload_schema_version,
     codec, status, max_retries, attempt_count, owner_id, lease_until,
     failure_reason, created_ts, updated_ts, started_ts, completed_ts";

/// Map a row selected with [`WORK_COLUMNS`] to a `WorkRecord`.
pub(crate) fn row_to_work(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkRecord> {
    let status_str: String = row.get(6)?;
    let status: WorkStatus = status_str
        .parse()
        .map_err(|e: String| conversion_error(6, e))?;

    Ok(WorkRecord {
        id: row.get(0)?,
        work_type: row.get(1)?,
        payload: row.get(2)?,
        payload_type: row.get(3)?,
        payload_schema_version: row.get(4)?,
        codec: row.get(5)?,
        status,
        max_retries: row.get(7)?,
        attempt_count: row.get(8)?,
        owner_id: row.get(9)?,
        lease_until: get_opt_ts(row, 10)?,
        failure_reason: row.get(11)?,
        created_ts: get_ts(row, 12)?,
        updated_ts: get_ts(row, 13)?,
        started_ts: get_opt_ts(row, 14)?,
        completed_ts: get_opt_ts(row, 15)?,
    })
}

pub(crate) fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        object: row.get(0)?,
        owner: row.get(1)?,
        expires_at: get_ts(row, 2)?,
    })
}

fn get_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    ts_from_db(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn get_opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| ts_from_db(&s).map_err(|e| conversion_error(idx, e.to_string())))
        .transpose()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}
