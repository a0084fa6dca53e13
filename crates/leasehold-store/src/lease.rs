use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::sqlite::{row_to_lease, SqliteStore};
use crate::types::{add_duration, now_millis, ts_to_db, Lease};

/// Atomic acquire/renew/release of a named lease.
///
/// Every method must be atomic with respect to concurrent callers on the
/// same `object`, across processes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease for `period`. Succeeds when no lease exists, when the
    /// existing one has expired, or when `owner` already holds it. Any other
    /// case returns `false` without touching the stored lease.
    async fn acquire(&self, owner: &str, object: &str, period: Duration) -> Result<bool>;

    /// Extend a lease `owner` still holds to `now + period`. Returns `false`
    /// when the lease is gone or held by someone else.
    async fn renew(&self, owner: &str, object: &str, period: Duration) -> Result<bool>;

    /// Delete the lease if `owner` still holds it. Absent leases are fine.
    async fn release(&self, owner: &str, object: &str) -> Result<()>;

    /// Snapshot of every stored lease, expired ones included.
    async fn list_leases(&self) -> Result<Vec<Lease>>;
}

#[async_trait]
impl LeaseStore for SqliteStore {
    #[instrument(skip(self), fields(period_ms = period.as_millis() as u64))]
    async fn acquire(&self, owner: &str, object: &str, period: Duration) -> Result<bool> {
        let now = now_millis();
        let expires_at = ts_to_db(add_duration(now, period));
        let now = ts_to_db(now);

        // Single upsert: the DO UPDATE branch only fires for an expired row
        // or our own row, so a live foreign lease yields zero changes.
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO leases (object, owner, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(object) DO UPDATE
                    SET owner = excluded.owner,
                        expires_at = excluded.expires_at
                  WHERE leases.expires_at <= ?4
                     OR leases.owner = excluded.owner",
                rusqlite::params![object, owner, expires_at, now],
            )?)
        })?;

        debug!(acquired = changed == 1, "lease acquire");
        Ok(changed == 1)
    }

    #[instrument(skip(self), fields(period_ms = period.as_millis() as u64))]
    async fn renew(&self, owner: &str, object: &str, period: Duration) -> Result<bool> {
        let expires_at = ts_to_db(add_duration(now_millis(), period));
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE leases SET expires_at = ?1 WHERE object = ?2 AND owner = ?3",
                rusqlite::params![expires_at, object, owner],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn release(&self, owner: &str, object: &str) -> Result<()> {
        let n = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM leases WHERE object = ?1 AND owner = ?2",
                rusqlite::params![object, owner],
            )?)
        })?;
        debug!(released = n == 1, "lease release");
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT object, owner, expires_at FROM leases ORDER BY object")?;
            let leases = stmt
                .query_map([], row_to_lease)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(leases)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let store = SqliteStore::open_in_memory().unwrap();
        let period = Duration::from_secs(60);

        assert!(store.acquire("a", "job", period).await.unwrap());
        assert!(!store.acquire("b", "job", period).await.unwrap());

        store.release("a", "job").await.unwrap();
        assert!(store.acquire("b", "job", period).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_owner_is_a_no_op() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.acquire("a", "job", Duration::from_secs(60)).await.unwrap());

        store.release("b", "job").await.unwrap();
        store.release("b", "missing").await.unwrap();

        let leases = store.list_leases().await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].owner, "a");
    }
}
