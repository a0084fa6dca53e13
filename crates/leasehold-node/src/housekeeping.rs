//! Built-in scheduled jobs every node registers.

use std::sync::Arc;

use chrono::Utc;
use leasehold_core::config::RetentionConfig;
use leasehold_scheduler::{LeasedScheduler, Schedule};
use leasehold_store::WorkStore;
use tracing::info;

pub const PURGE_JOB: &str = "purge-terminal-work";

/// Register the retention job: deletes terminal work older than
/// `keep_terminal`, on whichever node wins the trigger.
pub fn register(
    scheduler: &LeasedScheduler,
    store: Arc<dyn WorkStore>,
    retention: &RetentionConfig,
) -> anyhow::Result<()> {
    let schedule = Schedule::cron(&retention.purge_cron)?;
    let keep = retention.keep_terminal();
    scheduler.schedule(PURGE_JOB, schedule, move |ctx| {
        let store = Arc::clone(&store);
        async move {
            if ctx.is_cancelled() {
                return anyhow::Ok(());
            }
            let purged = purge_once(store.as_ref(), keep).await?;
            info!(owner = %ctx.owner, purged, "retention pass complete");
            anyhow::Ok(())
        }
    })?;
    Ok(())
}

pub async fn purge_once(store: &dyn WorkStore, keep: std::time::Duration) -> anyhow::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::from_std(keep)?;
    Ok(store.purge_terminal(cutoff).await?)
}
