use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// All of these are configuration errors raised synchronously by
/// registration or construction; lease denials and job failures at runtime
/// are logged, never returned.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job with this name is already registered on this scheduler.
    #[error("Duplicate job name: {name}")]
    DuplicateJob { name: String },

    /// Jobs can only be registered before `start()`.
    #[error("Scheduler already started; cannot register {name}")]
    AlreadyStarted { name: String },

    /// `start()` after `stop()`.
    #[error("Scheduler has been stopped")]
    Stopped,

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
