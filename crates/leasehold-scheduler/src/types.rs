use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};

/// Defines when and how often a job should fire.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fire repeatedly with a constant interval.
    FixedRate { every: Duration },

    /// Fire according to a cron expression (seconds field included,
    /// e.g. `"0 */5 * * * *"`), evaluated in UTC.
    Cron {
        expression: String,
        parsed: cron::Schedule,
    },
}

impl Schedule {
    pub fn fixed_rate(every: Duration) -> Result<Self> {
        if every.is_zero() {
            return Err(SchedulerError::InvalidSchedule(
                "fixed-rate interval must be greater than zero".to_string(),
            ));
        }
        Ok(Schedule::FixedRate { every })
    }

    pub fn cron(expression: &str) -> Result<Self> {
        let parsed = cron::Schedule::from_str(expression)
            .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression:?}: {e}")))?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
            parsed,
        })
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::FixedRate { every } => write!(f, "every {}ms", every.as_millis()),
            Schedule::Cron { expression, .. } => write!(f, "cron({expression})"),
        }
    }
}

/// Handed to every job run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    /// Node id that holds the lease for this run.
    pub owner: String,
    /// Cancelled when the lease is lost or a shutdown abandons the run.
    /// Long-running bodies should check it at their await points.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A job body. Errors are logged; they never stop the schedule.
pub type JobAction = Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One registration: immutable once the scheduler has started.
pub(crate) struct ScheduledJob {
    pub name: String,
    pub schedule: Schedule,
    pub action: JobAction,
}
