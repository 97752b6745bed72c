use rf_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatchError>;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("fragment encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid sender identifier: {0:?}")]
    InvalidSender(String),

    #[error("invalid batch settings: {0}")]
    Settings(String),
}

impl BatchError {
    /// True when retrying the same call may succeed (store connectivity only).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Codec(_) | Self::InvalidSender(_) | Self::Settings(_) => false,
        }
    }
}
