use std::sync::Arc;

use anyhow::Context;
use leasehold_core::LeaseholdConfig;
use leasehold_scheduler::LeasedScheduler;
use leasehold_store::{LeaseStore, Page, SqliteStore, WorkFilter, WorkRecord, WorkStatus};
use leasehold_worker::{JsonCodec, SubmitOptions, WorkClient};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::housekeeping;

/// Start the scheduler with the built-in jobs and block until Ctrl-C.
pub async fn run(config: &LeaseholdConfig, store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let node_id = config
        .node
        .id
        .clone()
        .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()));

    let scheduler = LeasedScheduler::new(node_id.clone(), store.clone(), config.scheduler.clone())?;
    housekeeping::register(&scheduler, store, &config.retention)?;
    scheduler.start()?;
    info!(%node_id, jobs = ?scheduler.job_names(), "node running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}

pub async fn submit(
    store: Arc<SqliteStore>,
    work_type: &str,
    payload_type: &str,
    payload: &Value,
    max_retries: Option<u32>,
    schema_version: u32,
) -> anyhow::Result<()> {
    let opts = SubmitOptions {
        max_retries,
        schema_version,
    };
    let handle = client(store)
        .submit(work_type, payload_type, payload, opts)
        .await?;
    print_json(&serde_json::to_value(&handle)?)
}

pub async fn get(store: Arc<SqliteStore>, id: &str) -> anyhow::Result<()> {
    let client = client(store);
    let record = client
        .get(id)
        .await?
        .with_context(|| format!("no work record {id}"))?;
    print_json(&record_view(&client, &record))
}

pub async fn list(
    store: Arc<SqliteStore>,
    work_type: Option<String>,
    statuses: &[String],
    limit: usize,
    offset: usize,
) -> anyhow::Result<()> {
    let statuses = if statuses.is_empty() {
        None
    } else {
        Some(
            statuses
                .iter()
                .map(|s| s.parse::<WorkStatus>().map_err(anyhow::Error::msg))
                .collect::<anyhow::Result<Vec<_>>>()?,
        )
    };
    let filter = WorkFilter {
        work_type,
        statuses,
        ..WorkFilter::default()
    };
    let client = client(store);
    let records = client.list(&filter, Page { limit, offset }).await?;
    let rows: Vec<Value> = records.iter().map(|r| record_view(&client, r)).collect();
    print_json(&Value::Array(rows))
}

#[derive(Debug, Clone, Copy)]
pub enum Transition {
    Cancel,
    Pause,
    Resume,
}

pub async fn transition(store: Arc<SqliteStore>, op: Transition, id: &str) -> anyhow::Result<()> {
    let client = client(store);
    let changed = match op {
        Transition::Cancel => client.cancel(id).await?,
        Transition::Pause => client.pause(id).await?,
        Transition::Resume => client.resume(id).await?,
    };
    if !changed {
        warn!(work_id = %id, ?op, "no change: record missing or not in a state that allows it");
    }
    print_json(&json!({ "id": id, "changed": changed }))
}

pub async fn leases(store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let rows: Vec<Value> = store
        .list_leases()
        .await?
        .into_iter()
        .map(|l| {
            json!({
                "object": l.object,
                "owner": l.owner,
                "expires_at": l.expires_at,
                "valid": l.is_valid_at(now),
            })
        })
        .collect();
    print_json(&Value::Array(rows))
}

fn client(store: Arc<SqliteStore>) -> WorkClient {
    WorkClient::new(store, Arc::new(JsonCodec))
}

/// Record as shown to operators: payload decoded when possible, raw size
/// otherwise.
fn record_view(client: &WorkClient, r: &WorkRecord) -> Value {
    let payload = match client.payload(r) {
        Ok(v) => v,
        Err(e) => json!({ "undecoded_bytes": r.payload.len(), "error": e.to_string() }),
    };
    json!({
        "id": r.id,
        "work_type": r.work_type,
        "payload_type": r.payload_type,
        "payload_schema_version": r.payload_schema_version,
        "codec": r.codec,
        "payload": payload,
        "status": r.status,
        "max_retries": r.max_retries,
        "attempt_count": r.attempt_count,
        "owner_id": r.owner_id,
        "lease_until": r.lease_until,
        "failure_reason": r.failure_reason,
        "created_ts": r.created_ts,
        "updated_ts": r.updated_ts,
        "started_ts": r.started_ts,
        "completed_ts": r.completed_ts,
    })
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_store::WorkStore;

    #[tokio::test]
    async fn record_view_decodes_json_payloads() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let client = client(store.clone());
        let h = client
            .submit("email", "welcome", &json!({"to": "ops@example.com"}), SubmitOptions::default())
            .await
            .unwrap();
        let rec = store.get_work(&h.id).await.unwrap().unwrap();

        let view = record_view(&client, &rec);
        assert_eq!(view["payload"]["to"], "ops@example.com");
        assert_eq!(view["status"], "NEW");
        assert_eq!(view["attempt_count"], 0);
    }

    #[tokio::test]
    async fn record_view_survives_foreign_codecs() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let rec = store
            .create_work(leasehold_store::NewWork {
                work_type: "email".to_string(),
                payload: vec![1, 2, 3],
                payload_type: "welcome".to_string(),
                payload_schema_version: 1,
                codec: "msgpack".to_string(),
                max_retries: None,
            })
            .await
            .unwrap();
        let view = record_view(&client(store), &rec);
        assert_eq!(view["payload"]["undecoded_bytes"], 3);
    }
}
