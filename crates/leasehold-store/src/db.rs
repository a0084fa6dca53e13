use rusqlite::Connection;

use crate::error::Result;

/// Initialise the lease and work schema in `conn`. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_leases_table(conn)?;
    create_work_table(conn)?;
    Ok(())
}

/// One row per leased object; `object` uniqueness is what makes acquire atomic.
fn create_leases_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS leases (
            object      TEXT NOT NULL PRIMARY KEY,
            owner       TEXT NOT NULL,
            expires_at  TEXT NOT NULL    -- fixed-width RFC 3339, UTC, millis
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_work_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS work (
            id                      TEXT    NOT NULL PRIMARY KEY,
            work_type               TEXT    NOT NULL,
            payload                 BLOB    NOT NULL,
            payload_type            TEXT    NOT NULL,
            payload_schema_version  INTEGER NOT NULL,
            codec                   TEXT    NOT NULL,
            status                  TEXT    NOT NULL DEFAULT 'new',
            max_retries             INTEGER,          -- NULL: processor default
            attempt_count           INTEGER NOT NULL DEFAULT 0,
            owner_id                TEXT,
            lease_until             TEXT,             -- lease expiry, or not-before after a reschedule
            failure_reason          TEXT,
            created_ts              TEXT    NOT NULL,
            updated_ts              TEXT    NOT NULL,
            started_ts              TEXT,
            completed_ts            TEXT
        ) STRICT;

        -- Claim query: WHERE work_type = ? AND status IN (...) AND lease_until <= ?
        CREATE INDEX IF NOT EXISTS idx_work_claim
            ON work (work_type, status, lease_until);
        CREATE INDEX IF NOT EXISTS idx_work_created
            ON work (created_ts);
        ",
    )?;
    Ok(())
}
