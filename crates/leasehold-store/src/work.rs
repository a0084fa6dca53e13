use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::sqlite::{row_to_work, SqliteStore, WORK_COLUMNS};
use crate::tx::run_in_transaction;
use crate::types::{add_duration, now_millis, ts_to_db, NewWork, Page, WorkFilter, WorkRecord};

/// Durable work records and the claim protocol over them.
///
/// Every mutation after `claim_work` is keyed by `(id, owner)`: a caller that
/// no longer owns the record gets `false` back and nothing changes.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert a record in `NEW` state.
    async fn create_work(&self, new: NewWork) -> Result<WorkRecord>;

    async fn get_work(&self, id: &str) -> Result<Option<WorkRecord>>;

    async fn list_work(&self, filter: &WorkFilter, page: Page) -> Result<Vec<WorkRecord>>;

    /// Atomically claim up to `limit` eligible records of `work_type`.
    ///
    /// Eligible means non-terminal, not paused, and either unowned or with an
    /// expired lease (for `NEW` rows, a passed not-before marker). Claimed
    /// rows move to `IN_PROGRESS` with `owner_id = owner`,
    /// `lease_until = now + lease` and `attempt_count` incremented. No two
    /// concurrent calls ever return the same record while its lease is valid.
    async fn claim_work(
        &self,
        work_type: &str,
        owner: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WorkRecord>>;

    async fn renew_worker_lease(&self, id: &str, owner: &str, lease: Duration) -> Result<bool>;

    /// Return a claimed record to `NEW`, eligible again after `delay`.
    /// `reason` (the failure that caused the retry) is kept for operators.
    async fn reschedule(
        &self,
        id: &str,
        owner: &str,
        delay: Duration,
        reason: Option<&str>,
    ) -> Result<bool>;

    async fn mark_succeeded(&self, id: &str, owner: &str) -> Result<bool>;

    async fn mark_failed(&self, id: &str, owner: &str, reason: &str) -> Result<bool>;

    /// Cancel from any non-terminal state. `false` if already terminal.
    async fn mark_cancelled(&self, id: &str) -> Result<bool>;

    /// `NEW → PAUSED`; paused records are never claimed.
    async fn pause(&self, id: &str) -> Result<bool>;

    /// `PAUSED → NEW`, immediately eligible.
    async fn resume(&self, id: &str) -> Result<bool>;

    /// Delete terminal records last updated before `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Eligibility predicate, `now` being the SQL parameter holding the current
/// time. `IN_PROGRESS` rows only qualify once their lease has lapsed.
fn claimable(now: &str) -> String {
    format!(
        "status IN ('new', 'in_progress')
         AND (lease_until IS NULL OR lease_until <= {now})"
    )
}

const TERMINAL: &str = "('cancelled', 'failed', 'succeeded')";

#[async_trait]
impl WorkStore for SqliteStore {
    #[instrument(skip(self, new), fields(work_type = %new.work_type, payload_type = %new.payload_type))]
    async fn create_work(&self, new: NewWork) -> Result<WorkRecord> {
        let id = Uuid::now_v7().to_string();
        let now = ts_to_db(now_millis());
        let sql = format!(
            "INSERT INTO work
             (id, work_type, payload, payload_type, payload_schema_version, codec,
              status, max_retries, attempt_count, created_ts, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'new', ?7, 0, ?8, ?8)
             RETURNING {WORK_COLUMNS}"
        );
        let record = self.with_conn(|conn| {
            Ok(conn.query_row(
                &sql,
                rusqlite::params![
                    id,
                    new.work_type,
                    new.payload,
                    new.payload_type,
                    new.payload_schema_version,
                    new.codec,
                    new.max_retries,
                    now,
                ],
                row_to_work,
            )?)
        })?;
        info!(work_id = %record.id, "work created");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn get_work(&self, id: &str) -> Result<Option<WorkRecord>> {
        let sql = format!("SELECT {WORK_COLUMNS} FROM work WHERE id = ?1");
        self.with_conn(|conn| Ok(conn.query_row(&sql, [id], row_to_work).optional()?))
    }

    #[instrument(skip(self, filter), fields(limit = page.limit, offset = page.offset))]
    async fn list_work(&self, filter: &WorkFilter, page: Page) -> Result<Vec<WorkRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("id IN ({})", placeholders(ids.len())));
            params.extend(ids.iter().cloned().map(Value::Text));
        }
        if let Some(work_type) = &filter.work_type {
            clauses.push("work_type = ?".to_string());
            params.push(Value::Text(work_type.clone()));
        }
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("status IN ({})", placeholders(statuses.len())));
            params.extend(statuses.iter().map(|s| Value::Text(s.to_string())));
        }
        if let Some(after) = filter.created_after {
            clauses.push("created_ts > ?".to_string());
            params.push(Value::Text(ts_to_db(after)));
        }
        if let Some(before) = filter.created_before {
            clauses.push("created_ts < ?".to_string());
            params.push(Value::Text(ts_to_db(before)));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        params.push(Value::Integer(page.limit as i64));
        params.push(Value::Integer(page.offset as i64));

        let sql = format!(
            "SELECT {WORK_COLUMNS} FROM work {where_sql}
             ORDER BY created_ts, id
             LIMIT ? OFFSET ?"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), row_to_work)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self), fields(lease_ms = lease.as_millis() as u64))]
    async fn claim_work(
        &self,
        work_type: &str,
        owner: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<WorkRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = now_millis();
        let lease_until = ts_to_db(add_duration(now, lease));
        let now = ts_to_db(now);

        let select_sql = format!(
            "SELECT id FROM work
             WHERE work_type = ?1 AND {}
             ORDER BY created_ts
             LIMIT ?3",
            claimable("?2")
        );

        // Re-check eligibility per id so a candidate taken between select
        // and update is dropped rather than returned twice.
        let update_sql = format!(
            "UPDATE work
                SET status = 'in_progress',
                    owner_id = ?1,
                    lease_until = ?2,
                    attempt_count = attempt_count + 1,
                    started_ts = ?3,
                    updated_ts = ?3
              WHERE id = ?4 AND work_type = ?5 AND {}
              RETURNING {WORK_COLUMNS}",
            claimable("?3")
        );

        let claimed = self.with_conn(|conn| {
            run_in_transaction(conn, |tx| {
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare_cached(&select_sql)?;
                    let rows = stmt
                        .query_map(rusqlite::params![work_type, now, limit as i64], |row| {
                            row.get(0)
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                let mut update = tx.prepare_cached(&update_sql)?;
                let mut claimed = Vec::with_capacity(ids.len());
                for id in ids {
                    let record = update
                        .query_row(
                            rusqlite::params![owner, lease_until, now, id, work_type],
                            row_to_work,
                        )
                        .optional()?;
                    match record {
                        Some(record) => claimed.push(record),
                        None => debug!(work_id = %id, "claim lost to a concurrent claimer"),
                    }
                }
                Ok(claimed)
            })
        })?;

        debug!(count = claimed.len(), "work claimed");
        Ok(claimed)
    }

    #[instrument(skip(self, lease))]
    async fn renew_worker_lease(&self, id: &str, owner: &str, lease: Duration) -> Result<bool> {
        let now = now_millis();
        let lease_until = ts_to_db(add_duration(now, lease));
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work SET lease_until = ?1, updated_ts = ?2
                 WHERE id = ?3 AND owner_id = ?4 AND status = 'in_progress'",
                rusqlite::params![lease_until, ts_to_db(now), id, owner],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self, reason), fields(delay_ms = delay.as_millis() as u64))]
    async fn reschedule(
        &self,
        id: &str,
        owner: &str,
        delay: Duration,
        reason: Option<&str>,
    ) -> Result<bool> {
        let now = now_millis();
        let not_before = ts_to_db(add_duration(now, delay));
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work
                    SET status = 'new',
                        owner_id = NULL,
                        lease_until = ?1,
                        failure_reason = COALESCE(?2, failure_reason),
                        updated_ts = ?3
                  WHERE id = ?4 AND owner_id = ?5 AND status = 'in_progress'",
                rusqlite::params![not_before, reason, ts_to_db(now), id, owner],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn mark_succeeded(&self, id: &str, owner: &str) -> Result<bool> {
        let now = ts_to_db(now_millis());
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work
                    SET status = 'succeeded',
                        owner_id = NULL,
                        lease_until = NULL,
                        completed_ts = ?1,
                        updated_ts = ?1
                  WHERE id = ?2 AND owner_id = ?3 AND status = 'in_progress'",
                rusqlite::params![now, id, owner],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, id: &str, owner: &str, reason: &str) -> Result<bool> {
        let now = ts_to_db(now_millis());
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work
                    SET status = 'failed',
                        owner_id = NULL,
                        lease_until = NULL,
                        failure_reason = ?1,
                        completed_ts = ?2,
                        updated_ts = ?2
                  WHERE id = ?3 AND owner_id = ?4 AND status = 'in_progress'",
                rusqlite::params![reason, now, id, owner],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let now = ts_to_db(now_millis());
        let sql = format!(
            "UPDATE work
                SET status = 'cancelled',
                    owner_id = NULL,
                    lease_until = NULL,
                    completed_ts = ?1,
                    updated_ts = ?1
              WHERE id = ?2 AND status NOT IN {TERMINAL}"
        );
        let changed =
            self.with_conn(|conn| Ok(conn.execute(&sql, rusqlite::params![now, id])?))?;
        if changed == 0 {
            debug!("cancel ignored: record missing or already terminal");
        }
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn pause(&self, id: &str) -> Result<bool> {
        let now = ts_to_db(now_millis());
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work SET status = 'paused', updated_ts = ?1
                 WHERE id = ?2 AND status = 'new'",
                rusqlite::params![now, id],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn resume(&self, id: &str) -> Result<bool> {
        let now = ts_to_db(now_millis());
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE work SET status = 'new', lease_until = NULL, updated_ts = ?1
                 WHERE id = ?2 AND status = 'paused'",
                rusqlite::params![now, id],
            )?)
        })?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let sql = format!("DELETE FROM work WHERE status IN {TERMINAL} AND updated_ts < ?1");
        let n = self.with_conn(|conn| Ok(conn.execute(&sql, [ts_to_db(before)])?))?;
        if n > 0 {
            info!(count = n, "purged terminal work");
        }
        Ok(n)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkStatus;

    fn new_work(work_type: &str) -> NewWork {
        NewWork {
            work_type: work_type.to_string(),
            payload: br#"{"to":"a@example.com"}"#.to_vec(),
            payload_type: "welcome".to_string(),
            payload_schema_version: 1,
            codec: "json".to_string(),
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn created_record_starts_new_and_unowned() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = store.create_work(new_work("email")).await.unwrap();
        assert_eq!(rec.status, WorkStatus::New);
        assert_eq!(rec.attempt_count, 0);
        assert!(rec.owner_id.is_none());
        assert!(rec.lease_until.is_none());
        assert_eq!(store.get_work(&rec.id).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn claim_ignores_other_work_types_and_paused() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_work(new_work("sms")).await.unwrap();
        let paused = store.create_work(new_work("email")).await.unwrap();
        assert!(store.pause(&paused.id).await.unwrap());

        let claimed = store
            .claim_work("email", "a", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        assert!(store.resume(&paused.id).await.unwrap());
        let claimed = store
            .claim_work("email", "a", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn rescheduled_record_waits_for_its_delay() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = store.create_work(new_work("email")).await.unwrap();
        let lease = Duration::from_secs(60);

        store.claim_work("email", "a", 1, lease).await.unwrap();
        assert!(store
            .reschedule(&rec.id, "a", Duration::from_secs(60), Some("smtp down"))
            .await
            .unwrap());

        let rec = store.get_work(&rec.id).await.unwrap().unwrap();
        assert_eq!(rec.status, WorkStatus::New);
        assert!(rec.owner_id.is_none());
        assert_eq!(rec.failure_reason.as_deref(), Some("smtp down"));
        assert!(store.claim_work("email", "b", 1, lease).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_records() {
        let store = SqliteStore::open_in_memory().unwrap();
        let done = store.create_work(new_work("email")).await.unwrap();
        let open = store.create_work(new_work("email")).await.unwrap();
        assert!(store.mark_cancelled(&done.id).await.unwrap());

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.purge_terminal(cutoff).await.unwrap(), 1);
        assert!(store.get_work(&done.id).await.unwrap().is_none());
        assert!(store.get_work(&open.id).await.unwrap().is_some());
    }
}
