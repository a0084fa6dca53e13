use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A time-bounded, exclusively owned claim on a named object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub object: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// An expired lease is logically absent and may be taken over.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Lifecycle state of a work record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Waiting to be claimed (possibly not before `lease_until`).
    New,
    /// Claimed by `owner_id` until `lease_until`.
    InProgress,
    /// Held back by an operator; never claimed.
    Paused,
    Cancelled,
    Failed,
    Succeeded,
}

impl WorkStatus {
    pub const ALL: [WorkStatus; 6] = [
        WorkStatus::New,
        WorkStatus::InProgress,
        WorkStatus::Paused,
        WorkStatus::Cancelled,
        WorkStatus::Failed,
        WorkStatus::Succeeded,
    ];

    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Cancelled | WorkStatus::Failed | WorkStatus::Succeeded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::New => "new",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Paused => "paused",
            WorkStatus::Cancelled => "cancelled",
            WorkStatus::Failed => "failed",
            WorkStatus::Succeeded => "succeeded",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(WorkStatus::New),
            "in_progress" => Ok(WorkStatus::InProgress),
            "paused" => Ok(WorkStatus::Paused),
            "cancelled" => Ok(WorkStatus::Cancelled),
            "failed" => Ok(WorkStatus::Failed),
            "succeeded" => Ok(WorkStatus::Succeeded),
            other => Err(format!("unknown work status: {other}")),
        }
    }
}

/// The durable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRecord {
    /// UUID v7 string, primary key.
    pub id: String,
    /// Routing key; one processor serves one work type.
    pub work_type: String,
    pub payload: Vec<u8>,
    /// Selects the handler inside the processor.
    pub payload_type: String,
    pub payload_schema_version: u32,
    /// Name of the codec that produced `payload`.
    pub codec: String,
    pub status: WorkStatus,
    /// `None` means "use the processor default".
    pub max_retries: Option<u32>,
    /// Incremented on every successful claim.
    pub attempt_count: u32,
    pub owner_id: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
    pub started_ts: Option<DateTime<Utc>>,
    pub completed_ts: Option<DateTime<Utc>>,
}

/// Everything the caller supplies when creating a work record.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub work_type: String,
    pub payload: Vec<u8>,
    pub payload_type: String,
    pub payload_schema_version: u32,
    pub codec: String,
    pub max_retries: Option<u32>,
}

/// Conjunctive filter for [`WorkStore::list_work`](crate::WorkStore::list_work).
/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub ids: Option<Vec<String>>,
    pub work_type: Option<String>,
    pub statuses: Option<Vec<WorkStatus>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// 0000-01-01T00:00:00.000Z, the earliest instant with a four-digit year.
const EARLIEST_DB_MILLIS: i64 = -62_167_219_200_000;
/// 9999-12-31T23:59:59.999Z, the latest instant with a four-digit year.
const LATEST_DB_MILLIS: i64 = 253_402_300_799_999;

/// Fixed-width encoding so lexical order in SQL equals chronological order.
/// Instants outside years 0000..=9999 are clamped; a wider year would break
/// the fixed width.
pub(crate) fn ts_to_db(ts: DateTime<Utc>) -> String {
    clamp_to_db_range(ts).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn clamp_to_db_range(ts: DateTime<Utc>) -> DateTime<Utc> {
    let millis = ts
        .timestamp_millis()
        .clamp(EARLIEST_DB_MILLIS, LATEST_DB_MILLIS);
    DateTime::from_timestamp_millis(millis).unwrap_or(ts)
}

pub(crate) fn ts_from_db(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidValue(format!("bad timestamp {raw:?}: {e}")))
}

/// Millisecond-truncated "now", matching what is persisted.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) fn add_duration(ts: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX);
    let sum = ts.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    clamp_to_db_range(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in WorkStatus::ALL {
            assert_eq!(status.to_string().parse::<WorkStatus>(), Ok(status));
        }
        assert!("running".parse::<WorkStatus>().is_err());
    }

    #[test]
    fn only_three_statuses_are_terminal() {
        let terminal: Vec<_> = WorkStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                WorkStatus::Cancelled,
                WorkStatus::Failed,
                WorkStatus::Succeeded
            ]
        );
    }

    #[test]
    fn db_timestamps_sort_lexically() {
        let a = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let b = DateTime::from_timestamp_millis(1_700_000_000_001).unwrap();
        let c = DateTime::from_timestamp_millis(1_700_000_001_000).unwrap();
        assert!(ts_to_db(a) < ts_to_db(b));
        assert!(ts_to_db(b) < ts_to_db(c));
        assert_eq!(ts_from_db(&ts_to_db(b)).unwrap(), b);
    }

    #[test]
    fn far_future_saturates_at_year_9999() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let far = add_duration(now, std::time::Duration::from_secs(10_000 * 365 * 86_400));
        assert_eq!(ts_to_db(far), "9999-12-31T23:59:59.999Z");
        assert!(ts_to_db(now) < ts_to_db(far));
        assert_eq!(ts_from_db(&ts_to_db(far)).unwrap(), far);

        let max = add_duration(now, std::time::Duration::MAX);
        assert_eq!(ts_to_db(max), "9999-12-31T23:59:59.999Z");
        assert_eq!(ts_to_db(DateTime::<Utc>::MAX_UTC), "9999-12-31T23:59:59.999Z");
    }
}
