use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use leasehold_core::config::ProcessorConfig;
use leasehold_core::{run_lease_bound, LeaseBoundOutcome};
use leasehold_store::{WorkRecord, WorkStore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::Codec;
use crate::error::{Result, WorkerError};
use crate::handler::{HandlerRunner, WorkContext, WorkHandler};

/// Claims and runs work records of a single work type.
///
/// Any number of processors (in one process or many) may serve the same
/// work type; the claim protocol keeps them from running a record twice.
#[derive(Clone)]
pub struct WorkRequestProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    work_type: String,
    owner: String,
    store: Arc<dyn WorkStore>,
    codec: Arc<dyn Codec>,
    config: ProcessorConfig,
    handlers: DashMap<String, Arc<dyn HandlerRunner>>,
    /// Held by `register_handler` and `start` so a registration never lands
    /// after the poll loop has begun.
    lifecycle: Mutex<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    poller: TaskTracker,
    workers: TaskTracker,
    active: AtomicUsize,
    /// Cancellation handles of records being handled, keyed by work id.
    running: DashMap<String, CancellationToken>,
}

impl WorkRequestProcessor {
    pub fn new(
        work_type: impl Into<String>,
        owner: impl Into<String>,
        store: Arc<dyn WorkStore>,
        codec: Arc<dyn Codec>,
        config: ProcessorConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| WorkerError::Config(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                work_type: work_type.into(),
                owner: owner.into(),
                store,
                codec,
                config,
                handlers: DashMap::new(),
                lifecycle: Mutex::new(()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                poller: TaskTracker::new(),
                workers: TaskTracker::new(),
                active: AtomicUsize::new(0),
                running: DashMap::new(),
            }),
        })
    }

    pub fn work_type(&self) -> &str {
        &self.inner.work_type
    }

    /// Register the handler for `payload_type`. `work_type` must be the one
    /// this processor was built for.
    pub fn register_handler<H: WorkHandler>(
        &self,
        work_type: &str,
        payload_type: &str,
        handler: H,
    ) -> Result<()> {
        if work_type != self.inner.work_type {
            return Err(WorkerError::WorkTypeMismatch {
                expected: self.inner.work_type.clone(),
                actual: work_type.to_string(),
            });
        }
        let _lifecycle = self.inner.lifecycle.lock().unwrap();
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(WorkerError::AlreadyStarted);
        }
        match self.inner.handlers.entry(payload_type.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(WorkerError::DuplicateHandler {
                payload_type: payload_type.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(handler));
                info!(work_type, payload_type, "work handler registered");
                Ok(())
            }
        }
    }

    /// Begin polling. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(WorkerError::Stopped);
        }
        let _lifecycle = self.inner.lifecycle.lock().unwrap();
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.handlers.is_empty() {
            warn!(work_type = %self.inner.work_type, "processor started with no handlers");
        }
        info!(
            work_type = %self.inner.work_type,
            owner = %self.inner.owner,
            workers = self.inner.config.worker_threads,
            "work processor started"
        );
        self.inner.poller.spawn(poll_loop(Arc::clone(&self.inner)));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Records currently being handled on this node.
    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop polling and wait up to `shutdown_timeout` for in-flight
    /// records. Leftovers are cancelled and abandoned; their leases expire
    /// and another processor reclaims them. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(work_type = %self.inner.work_type, "work processor stopping");
        self.inner.shutdown.cancel();
        self.inner.poller.close();
        self.inner.poller.wait().await;
        self.inner.workers.close();

        if !self.await_termination(self.inner.config.shutdown_timeout()).await {
            warn!(
                work_type = %self.inner.work_type,
                abandoned = self.inner.running.len(),
                "shutdown timeout elapsed; cancelling in-flight work"
            );
            for entry in self.inner.running.iter() {
                entry.value().cancel();
            }
        }
        info!(work_type = %self.inner.work_type, "work processor stopped");
    }

    /// Wait until all in-flight records are done after `stop()`. Returns
    /// `false` if `timeout` elapsed first.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.workers.wait())
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for WorkRequestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRequestProcessor")
            .field("work_type", &self.inner.work_type)
            .field("owner", &self.inner.owner)
            .field("codec", &self.inner.codec.name())
            .field("running", &self.is_running())
            .finish()
    }
}

// --- poll loop ---------------------------------------------------------------

enum Poll {
    /// Every worker slot is taken.
    Busy,
    Idle,
    Dispatched(usize),
}

async fn poll_loop(inner: Arc<Inner>) {
    let base = inner.config.poll_interval();
    let mut delay = base;
    loop {
        delay = match poll_once(&inner).await {
            Poll::Busy => base,
            Poll::Idle => idle_delay(delay, base),
            Poll::Dispatched(n) => {
                debug!(dispatched = n, "claimed work");
                base
            }
        };
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Next poll delay after an empty claim: doubled, capped at ten times the
/// base interval.
fn idle_delay(current: Duration, base: Duration) -> Duration {
    current.saturating_mul(2).min(base.saturating_mul(10))
}

async fn poll_once(inner: &Arc<Inner>) -> Poll {
    let active = inner.active.load(Ordering::SeqCst);
    let free = inner.config.worker_threads.saturating_sub(active);
    if free == 0 {
        return Poll::Busy;
    }

    let claimed = match inner
        .store
        .claim_work(
            &inner.work_type,
            &inner.owner,
            free,
            inner.config.lease_duration(),
        )
        .await
    {
        Ok(records) => records,
        Err(e) => {
            warn!(work_type = %inner.work_type, error = %e, "claim failed");
            return Poll::Idle;
        }
    };
    if claimed.is_empty() {
        return Poll::Idle;
    }

    let n = claimed.len();
    for record in claimed {
        let slot = ActiveSlot::take(inner);
        let worker = Arc::clone(inner);
        inner.workers.spawn(async move {
            let _slot = slot;
            dispatch(&worker, record).await;
        });
    }
    Poll::Dispatched(n)
}

/// Holds one worker slot until dropped.
struct ActiveSlot(Arc<Inner>);

impl ActiveSlot {
    fn take(inner: &Arc<Inner>) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// --- dispatch ----------------------------------------------------------------

#[instrument(
    skip_all,
    fields(work_id = %record.id, payload_type = %record.payload_type, attempt = record.attempt_count)
)]
async fn dispatch(inner: &Arc<Inner>, record: WorkRecord) {
    // Configuration mismatches are never retried.
    if record.codec != inner.codec.name() {
        let reason = format!(
            "unsupported codec {:?}; processor uses {:?}",
            record.codec,
            inner.codec.name()
        );
        fail(inner, &record, &reason).await;
        return;
    }

    let payload = match inner.codec.decode(
        &record.payload,
        &record.payload_type,
        record.payload_schema_version,
    ) {
        Ok(payload) => payload,
        Err(e) => {
            fail(inner, &record, &format!("payload decode failed: {e}")).await;
            return;
        }
    };

    let handler = inner
        .handlers
        .get(&record.payload_type)
        .map(|h| Arc::clone(h.value()));
    let Some(handler) = handler else {
        let reason = format!("no handler registered for payload type {:?}", record.payload_type);
        fail(inner, &record, &reason).await;
        return;
    };

    let cancel = CancellationToken::new();
    let ctx = WorkContext {
        work_id: record.id.clone(),
        work_type: record.work_type.clone(),
        payload_type: record.payload_type.clone(),
        attempt: record.attempt_count,
        cancel: cancel.clone(),
    };
    let task = match handler.prepare(payload, ctx) {
        Ok(task) => task,
        Err(e) => {
            let reason = format!("payload does not match handler for {:?}: {e}", record.payload_type);
            fail(inner, &record, &reason).await;
            return;
        }
    };

    inner.running.insert(record.id.clone(), cancel.clone());
    let outcome = execute(inner, &record, task, cancel).await;
    inner.running.remove(&record.id);

    if outcome.lease_lost {
        warn!("lease lost while handling; outcome may not be recorded");
    }
    match outcome.output {
        Ok(Ok(())) => match inner.store.mark_succeeded(&record.id, &inner.owner).await {
            Ok(true) => info!("work succeeded"),
            Ok(false) => warn!("work finished but is no longer owned here"),
            Err(e) => error!(error = %e, "could not record success"),
        },
        Ok(Err(e)) => retry_or_fail(inner, &record, &format!("{e:#}")).await,
        Err(join) => retry_or_fail(inner, &record, &format!("handler panicked: {join}")).await,
    }
}

/// Run the handler while renewing the record's lease.
async fn execute(
    inner: &Arc<Inner>,
    record: &WorkRecord,
    task: futures_util::future::BoxFuture<'static, anyhow::Result<()>>,
    cancel: CancellationToken,
) -> LeaseBoundOutcome<anyhow::Result<()>> {
    let store = Arc::clone(&inner.store);
    let owner = inner.owner.clone();
    let id = record.id.clone();
    let lease = inner.config.lease_duration();
    run_lease_bound(task, cancel, inner.config.lease_renew_interval(), move || {
        let store = Arc::clone(&store);
        let owner = owner.clone();
        let id = id.clone();
        async move {
            match store.renew_worker_lease(&id, &owner, lease).await {
                Ok(renewed) => renewed,
                Err(e) => {
                    warn!(work_id = %id, error = %e, "worker lease renewal failed; treating lease as lost");
                    false
                }
            }
        }
    })
    .await
}

#[derive(Debug, PartialEq, Eq)]
enum RetryDecision {
    Reschedule(Duration),
    Fail,
}

/// `attempt` is the 1-based attempt that just failed, so `attempt - 1`
/// retries have been used so far.
fn retry_decision(attempt: u32, max_retries: Option<u32>, config: &ProcessorConfig) -> RetryDecision {
    let allowed = max_retries
        .unwrap_or(config.default_max_retries)
        .min(config.max_allowed_retries);
    if attempt.saturating_sub(1) >= allowed {
        return RetryDecision::Fail;
    }
    match config.backoff.next_delay(attempt) {
        Ok(delay) => RetryDecision::Reschedule(delay),
        Err(e) => {
            warn!(attempt, error = %e, "no backoff for attempt; failing");
            RetryDecision::Fail
        }
    }
}

async fn retry_or_fail(inner: &Arc<Inner>, record: &WorkRecord, reason: &str) {
    match retry_decision(record.attempt_count, record.max_retries, &inner.config) {
        RetryDecision::Fail => fail(inner, record, reason).await,
        RetryDecision::Reschedule(delay) => {
            match inner
                .store
                .reschedule(&record.id, &inner.owner, delay, Some(reason))
                .await
            {
                Ok(true) => info!(
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "work failed; retry scheduled"
                ),
                Ok(false) => warn!("work failed but is no longer owned here"),
                Err(e) => error!(error = %e, "could not reschedule work"),
            }
        }
    }
}

async fn fail(inner: &Arc<Inner>, record: &WorkRecord, reason: &str) {
    match inner.store.mark_failed(&record.id, &inner.owner, reason).await {
        Ok(true) => warn!(%reason, "work failed permanently"),
        Ok(false) => warn!(%reason, "work failed but is no longer owned here"),
        Err(e) => error!(error = %e, %reason, "could not record failure"),
    }
}
