use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use leasehold_core::config::SchedulerConfig;
use leasehold_core::run_lease_bound;
use leasehold_store::LeaseStore;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{Result, SchedulerError},
    schedule::next_deadline,
    types::{JobAction, JobContext, Schedule, ScheduledJob},
};

/// Runs named recurring jobs so that each trigger executes on at most one
/// node of the cluster.
///
/// Cheap to clone; clones share registrations and lifecycle.
#[derive(Clone)]
pub struct LeasedScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    owner: String,
    leases: Arc<dyn LeaseStore>,
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, Arc<ScheduledJob>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    /// One trigger loop per registered job.
    triggers: TaskTracker,
    /// Job bodies currently holding a lease.
    workers: TaskTracker,
    permits: Arc<Semaphore>,
    /// Cancellation handles of locally running jobs, keyed by job name.
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl LeasedScheduler {
    /// `owner` identifies this node in the lease table and must be unique
    /// across the cluster.
    pub fn new(
        owner: impl Into<String>,
        leases: Arc<dyn LeaseStore>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        let permits = Arc::new(Semaphore::new(config.worker_threads));
        Ok(Self {
            inner: Arc::new(Inner {
                owner: owner.into(),
                leases,
                config,
                jobs: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                triggers: TaskTracker::new(),
                workers: TaskTracker::new(),
                permits,
                running: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Register a recurring job. The name doubles as the lease object, so
    /// every node must register the same job under the same name.
    pub fn schedule<F, Fut>(&self, name: &str, schedule: Schedule, action: F) -> Result<()>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: JobAction = Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(action(ctx))
        });
        let mut jobs = self.inner.jobs.write().unwrap();
        // Checked under the write lock so a concurrent start() cannot miss it.
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted {
                name: name.to_string(),
            });
        }
        if jobs.contains_key(name) {
            return Err(SchedulerError::DuplicateJob {
                name: name.to_string(),
            });
        }
        info!(job = %name, %schedule, "job registered");
        jobs.insert(
            name.to_string(),
            Arc::new(ScheduledJob {
                name: name.to_string(),
                schedule,
                action,
            }),
        );
        Ok(())
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.jobs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Arm every registered job. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        let jobs = self.inner.jobs.read().unwrap();
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(owner = %self.inner.owner, jobs = jobs.len(), "leased scheduler started");
        for job in jobs.values() {
            let inner = Arc::clone(&self.inner);
            let job = Arc::clone(job);
            self.inner.triggers.spawn(trigger_loop(inner, job));
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop triggering, then give in-flight runs `shutdown_timeout` to
    /// finish. Runs still going after that are cancelled and abandoned;
    /// their leases simply expire. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(owner = %self.inner.owner, "leased scheduler stopping");
        self.inner.shutdown.cancel();
        self.inner.triggers.close();
        self.inner.triggers.wait().await;
        self.inner.workers.close();

        if !self.await_termination(self.inner.config.shutdown_timeout()).await {
            let running = self.inner.running.lock().unwrap();
            warn!(
                jobs = ?running.keys().collect::<Vec<_>>(),
                "shutdown timeout elapsed; cancelling running jobs"
            );
            for token in running.values() {
                token.cancel();
            }
        }
        info!(owner = %self.inner.owner, "leased scheduler stopped");
    }

    /// Wait until every job body has finished after `stop()`. Returns
    /// `false` if `timeout` elapsed first.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.workers.wait())
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for LeasedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedScheduler")
            .field("owner", &self.inner.owner)
            .field("jobs", &self.job_names())
            .field("running", &self.is_running())
            .finish()
    }
}

// --- private helpers ---------------------------------------------------------

/// Arm, fire, re-arm until shutdown. Each deadline is derived from the
/// previous one, not from when `fire` returned.
async fn trigger_loop(inner: Arc<Inner>, job: Arc<ScheduledJob>) {
    let mut last = Instant::now();
    loop {
        let Some(deadline) = next_deadline(&job.schedule, last, Instant::now(), Utc::now()) else {
            warn!(job = %job.name, "no further triggers; job disarmed");
            return;
        };
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        last = deadline;
        fire(&inner, &job).await;
    }
}

#[instrument(skip_all, fields(job = %job.name, owner = %inner.owner))]
async fn fire(inner: &Arc<Inner>, job: &Arc<ScheduledJob>) {
    // A renewed lease would let the next trigger re-acquire it while the
    // previous run is still going; never overlap runs on one node.
    if inner.running.lock().unwrap().contains_key(&job.name) {
        debug!("previous run still in progress; trigger skipped");
        return;
    }

    let Ok(permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
        warn!("worker pool saturated; trigger skipped");
        return;
    };

    match inner
        .leases
        .acquire(&inner.owner, &job.name, inner.config.lease_duration())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!("lease held by another node; trigger skipped");
            return;
        }
        Err(e) => {
            warn!(error = %e, "lease acquire failed; trigger skipped");
            return;
        }
    }

    let cancel = CancellationToken::new();
    inner
        .running
        .lock()
        .unwrap()
        .insert(job.name.clone(), cancel.clone());

    let task_inner = Arc::clone(inner);
    let job = Arc::clone(job);
    inner.workers.spawn(async move {
        run_job(&task_inner, &job, cancel, permit).await;
    });
}

async fn run_job(
    inner: &Arc<Inner>,
    job: &ScheduledJob,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let ctx = JobContext {
        job_name: job.name.clone(),
        owner: inner.owner.clone(),
        cancel: cancel.clone(),
    };
    debug!(job = %job.name, "job started");

    let leases = Arc::clone(&inner.leases);
    let owner = inner.owner.clone();
    let name = job.name.clone();
    let period = inner.config.lease_duration();
    let outcome = run_lease_bound(
        (job.action)(ctx),
        cancel,
        inner.config.lease_renew_interval(),
        move || {
            let leases = Arc::clone(&leases);
            let owner = owner.clone();
            let name = name.clone();
            async move {
                match leases.renew(&owner, &name, period).await {
                    Ok(renewed) => renewed,
                    Err(e) => {
                        warn!(job = %name, error = %e, "lease renewal failed; treating lease as lost");
                        false
                    }
                }
            }
        },
    )
    .await;

    match outcome.output {
        Ok(Ok(())) if outcome.lease_lost => {
            warn!(job = %job.name, "job finished after losing its lease")
        }
        Ok(Ok(())) => info!(job = %job.name, "job completed"),
        Ok(Err(e)) => warn!(job = %job.name, error = %e, "job failed"),
        Err(e) => error!(job = %job.name, error = %e, "job panicked"),
    }

    inner.running.lock().unwrap().remove(&job.name);
    if let Err(e) = inner.leases.release(&inner.owner, &job.name).await {
        warn!(job = %job.name, error = %e, "lease release failed; it will expire");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use leasehold_store::{Lease, SqliteStore};
    use std::sync::atomic::AtomicUsize;

    /// Never grants a lease; counts how often it was asked.
    #[derive(Default)]
    struct DenyAll {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LeaseStore for DenyAll {
        async fn acquire(&self, _: &str, _: &str, _: Duration) -> leasehold_store::Result<bool> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn renew(&self, _: &str, _: &str, _: Duration) -> leasehold_store::Result<bool> {
            Ok(false)
        }
        async fn release(&self, _: &str, _: &str) -> leasehold_store::Result<()> {
            Ok(())
        }
        async fn list_leases(&self) -> leasehold_store::Result<Vec<Lease>> {
            Ok(Vec::new())
        }
    }

    /// Denies every lease after a fixed store latency.
    #[derive(Default)]
    struct SlowDeny {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LeaseStore for SlowDeny {
        async fn acquire(&self, _: &str, _: &str, _: Duration) -> leasehold_store::Result<bool> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn renew(&self, _: &str, _: &str, _: Duration) -> leasehold_store::Result<bool> {
            Ok(false)
        }
        async fn release(&self, _: &str, _: &str) -> leasehold_store::Result<()> {
            Ok(())
        }
        async fn list_leases(&self) -> leasehold_store::Result<Vec<Lease>> {
            Ok(Vec::new())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            lease_duration_ms: 1_000,
            lease_renew_interval_ms: 200,
            worker_threads: 2,
            shutdown_timeout_ms: 500,
        }
    }

    fn every(ms: u64) -> Schedule {
        Schedule::fixed_rate(Duration::from_millis(ms)).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store: Arc<dyn LeaseStore> = Arc::new(DenyAll::default());
        let bad = SchedulerConfig {
            lease_renew_interval_ms: 5_000,
            lease_duration_ms: 1_000,
            ..config()
        };
        assert!(matches!(
            LeasedScheduler::new("n1", store, bad),
            Err(SchedulerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_and_late_registration_fail() {
        let sched = LeasedScheduler::new("n1", Arc::new(DenyAll::default()), config()).unwrap();
        sched.schedule("a", every(50), |_| async { anyhow::Ok(()) }).unwrap();

        let dup = sched.schedule("a", every(50), |_| async { anyhow::Ok(()) });
        assert!(matches!(dup, Err(SchedulerError::DuplicateJob { .. })));

        sched.start().unwrap();
        sched.start().unwrap();
        assert!(sched.is_running());

        let late = sched.schedule("b", every(50), |_| async { anyhow::Ok(()) });
        assert!(matches!(late, Err(SchedulerError::AlreadyStarted { .. })));

        sched.stop().await;
        sched.stop().await;
        assert!(!sched.is_running());
        assert!(matches!(sched.start(), Err(SchedulerError::Stopped)));
    }

    #[tokio::test]
    async fn denied_triggers_keep_their_cadence() {
        let store = Arc::new(DenyAll::default());
        let sched = LeasedScheduler::new("n1", store.clone(), config()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        sched
            .schedule("never", every(20), move |_| {
                let ran = ran2.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap();

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        sched.stop().await;

        let attempts = store.attempts.load(Ordering::SeqCst);
        assert!((6..=13).contains(&attempts), "attempts = {attempts}");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_latency_does_not_stretch_fixed_rate() {
        let store = Arc::new(SlowDeny::default());
        let sched = LeasedScheduler::new("n1", store.clone(), config()).unwrap();
        sched
            .schedule("steady", every(40), |_| async { anyhow::Ok(()) })
            .unwrap();

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(420)).await;
        sched.stop().await;

        // On the 40ms grid that is ~10 attempts; drifting by the 30ms
        // acquire latency would give ~6.
        let attempts = store.attempts.load(Ordering::SeqCst);
        assert!((8..=11).contains(&attempts), "attempts = {attempts}");
    }

    #[tokio::test]
    async fn lease_is_released_after_each_run() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sched = LeasedScheduler::new("n1", store.clone(), config()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        sched
            .schedule("tick", every(30), move |ctx| {
                let ran = ran2.clone();
                async move {
                    assert_eq!(ctx.job_name, "tick");
                    assert_eq!(ctx.owner, "n1");
                    ran.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap();

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        sched.stop().await;

        assert!(ran.load(Ordering::SeqCst) >= 3);
        assert!(store.list_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_job_keeps_firing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sched = LeasedScheduler::new("n1", store, config()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        sched
            .schedule("flaky", every(20), move |_| {
                let ran = ran2.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
                }
            })
            .unwrap();

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        sched.stop().await;
        assert!(ran.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn slow_run_is_cancelled_after_shutdown_timeout() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cfg = SchedulerConfig {
            shutdown_timeout_ms: 50,
            ..config()
        };
        let sched = LeasedScheduler::new("n1", store, cfg).unwrap();
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        sched
            .schedule("slow", every(10), move |ctx| {
                let flag = flag.clone();
                async move {
                    ctx.cancel.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap();

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.stop().await;
        assert!(sched.await_termination(Duration::from_secs(1)).await);
        assert!(interrupted.load(Ordering::SeqCst));
    }
}
