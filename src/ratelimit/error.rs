use thiserror::Error;

pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("rate limit store unavailable: {0}")]
    Store(String),
    #[error("circuit breaker is open; store not attempted")]
    CircuitOpen,
    #[error("store operation cancelled after {0} ms")]
    Cancelled(u64),
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),
}

impl AdmissionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store_error",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}
