use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseholdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),
}

impl LeaseholdError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            LeaseholdError::Config(_) => "CONFIG_ERROR",
            LeaseholdError::InvalidBackoff(_) => "INVALID_BACKOFF",
        }
    }
}

pub type Result<T> = std::result::Result<T, LeaseholdError>;
