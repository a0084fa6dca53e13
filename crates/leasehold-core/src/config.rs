use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::{LeaseholdError, Result};

pub const DEFAULT_SCHEDULER_LEASE_MS: u64 = 60_000;
pub const DEFAULT_SCHEDULER_RENEW_MS: u64 = 20_000;
pub const DEFAULT_WORK_LEASE_MS: u64 = 5 * 60_000;
pub const DEFAULT_WORK_RENEW_MS: u64 = 60_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_ALLOWED_RETRIES: u32 = 10;
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 3600;
pub const DEFAULT_PURGE_CRON: &str = "0 0 * * * *";

/// Top-level config (leasehold.toml + LEASEHOLD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseholdConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Lease owner identity. Generated per process when unset; two nodes
    /// must never share one.
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before erroring.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Tunables for the leased scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_lease_ms")]
    pub lease_duration_ms: u64,
    #[serde(default = "default_scheduler_renew_ms")]
    pub lease_renew_interval_ms: u64,
    /// Maximum number of job bodies running at once on this node.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: DEFAULT_SCHEDULER_LEASE_MS,
            lease_renew_interval_ms: DEFAULT_SCHEDULER_RENEW_MS,
            worker_threads: DEFAULT_WORKER_THREADS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_lease("scheduler", self.lease_duration_ms, self.lease_renew_interval_ms)?;
        if self.worker_threads == 0 {
            return Err(LeaseholdError::Config(
                "scheduler.worker_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tunables for a work request processor. The work type itself is chosen
/// per processor instance, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_work_lease_ms")]
    pub lease_duration_ms: u64,
    #[serde(default = "default_work_renew_ms")]
    pub lease_renew_interval_ms: u64,
    /// Used when a record carries no `max_retries` of its own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Hard ceiling applied even to records that ask for more.
    #[serde(default = "default_max_allowed_retries")]
    pub max_allowed_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            worker_threads: DEFAULT_WORKER_THREADS,
            lease_duration_ms: DEFAULT_WORK_LEASE_MS,
            lease_renew_interval_ms: DEFAULT_WORK_RENEW_MS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            max_allowed_retries: DEFAULT_MAX_ALLOWED_RETRIES,
            backoff: Backoff::default(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ProcessorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_lease("processor", self.lease_duration_ms, self.lease_renew_interval_ms)?;
        if self.worker_threads == 0 {
            return Err(LeaseholdError::Config(
                "processor.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(LeaseholdError::Config(
                "processor.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

/// Housekeeping for terminal work records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Terminal records older than this are purged.
    #[serde(default = "default_retention_secs")]
    pub keep_terminal_secs: u64,
    /// Cron expression (with seconds field) for the purge job.
    #[serde(default = "default_purge_cron")]
    pub purge_cron: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_terminal_secs: DEFAULT_RETENTION_SECS,
            purge_cron: DEFAULT_PURGE_CRON.to_string(),
        }
    }
}

impl RetentionConfig {
    pub fn keep_terminal(&self) -> Duration {
        Duration::from_secs(self.keep_terminal_secs)
    }
}

fn validate_lease(section: &str, lease_ms: u64, renew_ms: u64) -> Result<()> {
    if renew_ms == 0 {
        return Err(LeaseholdError::Config(format!(
            "{section}.lease_renew_interval_ms must be greater than zero"
        )));
    }
    if renew_ms >= lease_ms {
        return Err(LeaseholdError::Config(format!(
            "{section}.lease_renew_interval_ms ({renew_ms}) must be less than lease_duration_ms ({lease_ms})"
        )));
    }
    Ok(())
}

fn default_scheduler_lease_ms() -> u64 {
    DEFAULT_SCHEDULER_LEASE_MS
}
fn default_scheduler_renew_ms() -> u64 {
    DEFAULT_SCHEDULER_RENEW_MS
}
fn default_work_lease_ms() -> u64 {
    DEFAULT_WORK_LEASE_MS
}
fn default_work_renew_ms() -> u64 {
    DEFAULT_WORK_RENEW_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}
fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_max_allowed_retries() -> u32 {
    DEFAULT_MAX_ALLOWED_RETRIES
}
fn default_retention_secs() -> u64 {
    DEFAULT_RETENTION_SECS
}
fn default_purge_cron() -> String {
    DEFAULT_PURGE_CRON.to_string()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.leasehold/leasehold.db", home)
}

impl LeaseholdConfig {
    /// Load config from a TOML file with LEASEHOLD_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `LEASEHOLD_PROCESSOR__POLL_INTERVAL_MS=250`. A missing file is not an
    /// error; every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: LeaseholdConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("LEASEHOLD_").split("__"))
            .extract()
            .map_err(|e| LeaseholdError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.processor.validate()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.leasehold/leasehold.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        LeaseholdConfig::default().validate().unwrap();
    }

    #[test]
    fn renew_must_be_shorter_than_lease() {
        let cfg = SchedulerConfig {
            lease_duration_ms: 1_000,
            lease_renew_interval_ms: 1_000,
            ..SchedulerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ProcessorConfig {
            lease_duration_ms: 1_000,
            lease_renew_interval_ms: 2_000,
            ..ProcessorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = ProcessorConfig {
            worker_threads: 0,
            ..ProcessorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_and_env_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "leasehold.toml",
                r#"
                [node]
                id = "node-a"

                [processor]
                poll_interval_ms = 250
                default_max_retries = 5

                [processor.backoff]
                kind = "fixed"
                delay_ms = 100
                "#,
            )?;
            jail.set_env("LEASEHOLD_SCHEDULER__LEASE_DURATION_MS", "90000");

            let cfg = LeaseholdConfig::load(Some("leasehold.toml")).expect("load");
            assert_eq!(cfg.node.id.as_deref(), Some("node-a"));
            assert_eq!(cfg.processor.poll_interval_ms, 250);
            assert_eq!(cfg.processor.default_max_retries, 5);
            assert_eq!(cfg.processor.backoff, Backoff::Fixed { delay_ms: 100 });
            assert_eq!(cfg.scheduler.lease_duration_ms, 90_000);
            assert_eq!(
                cfg.scheduler.lease_renew_interval_ms,
                DEFAULT_SCHEDULER_RENEW_MS
            );
            Ok(())
        });
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "leasehold.toml",
                r#"
                [scheduler]
                lease_duration_ms = 100
                lease_renew_interval_ms = 500
                "#,
            )?;
            let err = LeaseholdConfig::load(Some("leasehold.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
