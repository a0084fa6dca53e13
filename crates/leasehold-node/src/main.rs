use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use leasehold_core::LeaseholdConfig;
use leasehold_store::SqliteStore;
use tracing::info;

mod commands;
mod housekeeping;

#[derive(Parser)]
#[command(name = "leasehold-node", about = "Lease-coordinated job scheduler and work queue")]
struct Cli {
    /// Config file. Falls back to LEASEHOLD_CONFIG, then ~/.leasehold/leasehold.toml
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run this node's scheduler until Ctrl-C
    Run,
    /// Queue a work request
    Submit {
        work_type: String,
        payload_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long, default_value_t = 1)]
        schema_version: u32,
    },
    /// Show one work record
    Get { id: String },
    /// List work records, oldest first
    List {
        #[arg(long)]
        work_type: Option<String>,
        /// Repeatable, e.g. --status new --status failed
        #[arg(long = "status")]
        statuses: Vec<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Cancel a non-terminal work record
    Cancel { id: String },
    /// Hold a new work record back from processors
    Pause { id: String },
    Resume { id: String },
    /// Show lease table
    Leases,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "leasehold_node=info,leasehold_scheduler=info,leasehold_worker=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit flag > LEASEHOLD_CONFIG env > ~/.leasehold/leasehold.toml
    let config_path = cli.config.or_else(|| std::env::var("LEASEHOLD_CONFIG").ok());
    let config = LeaseholdConfig::load(config_path.as_deref()).context("loading config")?;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(
        SqliteStore::open(db_path, config.database.busy_timeout())
            .with_context(|| format!("opening {db_path}"))?,
    );

    match cli.command {
        Command::Run => commands::run(&config, store).await,
        Command::Submit {
            work_type,
            payload_type,
            payload,
            max_retries,
            schema_version,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            commands::submit(store, &work_type, &payload_type, &payload, max_retries, schema_version)
                .await
        }
        Command::Get { id } => commands::get(store, &id).await,
        Command::List {
            work_type,
            statuses,
            limit,
            offset,
        } => commands::list(store, work_type, &statuses, limit, offset).await,
        Command::Cancel { id } => commands::transition(store, commands::Transition::Cancel, &id).await,
        Command::Pause { id } => commands::transition(store, commands::Transition::Pause, &id).await,
        Command::Resume { id } => commands::transition(store, commands::Transition::Resume, &id).await,
        Command::Leases => commands::leases(store).await,
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
