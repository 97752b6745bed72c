use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, IO or timeout failure. The operation may or may not have been applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("wrong value type at key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_connection_refusal()
        {
            Self::Unavailable(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}
