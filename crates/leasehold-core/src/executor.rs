use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a task that ran under a renewable lease.
#[derive(Debug)]
pub struct LeaseBoundOutcome<T> {
    /// The task's own output, or the join error if it panicked or was aborted.
    pub output: Result<T, JoinError>,
    /// True once a renewal reported the lease as gone. The task may still have
    /// completed normally after that point.
    pub lease_lost: bool,
}

impl<T> LeaseBoundOutcome<T> {
    pub fn panicked(&self) -> bool {
        matches!(&self.output, Err(e) if e.is_panic())
    }
}

/// Run `task` while `renew` is called every `renew_every`.
///
/// The first renewal fires one period after start. When `renew` returns
/// `false` the renewal timer stops and `cancel` is triggered; the task is
/// expected to observe the token at its next await point but is never
/// aborted, so this returns only once the task itself finishes.
pub async fn run_lease_bound<T, Fut, R, RFut>(
    task: Fut,
    cancel: CancellationToken,
    renew_every: Duration,
    mut renew: R,
) -> LeaseBoundOutcome<T>
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    R: FnMut() -> RFut,
    RFut: Future<Output = bool>,
{
    let mut handle = tokio::spawn(task);
    let mut ticker = interval_at(Instant::now() + renew_every, renew_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lease_lost = false;

    loop {
        tokio::select! {
            joined = &mut handle => {
                return LeaseBoundOutcome { output: joined, lease_lost };
            }
            _ = ticker.tick(), if !lease_lost => {
                if renew().await {
                    debug!("lease renewed");
                } else {
                    warn!("lease renewal rejected, interrupting task");
                    lease_lost = true;
                    cancel.cancel();
                }
            }
        }
    }
}
