use leasehold_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Processor handles work type {expected:?}, not {actual:?}")]
    WorkTypeMismatch { expected: String, actual: String },

    #[error("Handler already registered for payload type {payload_type:?}")]
    DuplicateHandler { payload_type: String },

    #[error("Processor already started")]
    AlreadyStarted,

    #[error("Processor has been stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            WorkerError::WorkTypeMismatch { .. } => "WORK_TYPE_MISMATCH",
            WorkerError::DuplicateHandler { .. } => "DUPLICATE_HANDLER",
            WorkerError::AlreadyStarted => "ALREADY_STARTED",
            WorkerError::Stopped => "STOPPED",
            WorkerError::Config(_) => "CONFIG_ERROR",
            WorkerError::Codec(_) => "CODEC_ERROR",
            WorkerError::InvalidRequest(_) => "INVALID_REQUEST",
            WorkerError::Store(_) => "STORE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
