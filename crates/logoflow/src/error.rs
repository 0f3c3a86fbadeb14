use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

/// Bad input rejected before any side effect.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("No image file provided")]
    MissingFile,
    #[error("File name is required")]
    MissingFileName,
    #[error("Invalid file type {0:?}. Allowed types: {1}")]
    UnsupportedContentType(String, String),
    #[error("File too large. Maximum size is {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error("File is empty")]
    Empty,
    #[error("Malformed upload: {0}")]
    Malformed(String),
    #[error("Invalid request")]
    InvalidRequest,
    #[error("Invalid job id")]
    InvalidJobId,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob store call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
    #[error("ledger row is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker rejected the message")]
    Rejected,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] lapin::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// The detector failed on valid input. Terminal for the job.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("detector timed out after {0:?}")]
    Timeout(Duration),
    #[error("detector rejected job with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detector returned an unreadable response: {0}")]
    BadResponse(String),
}

/// Error surfaced by one ingestion attempt. Each variant names the step that aborted it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage step failed: {0}")]
    Storage(#[from] StorageError),
    #[error("persistence step failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("delivery step failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("processing failed: {0}")]
    Processing(#[from] ProcessingError),
}

impl PipelineError {
    /// Stable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Delivery(_) => "DELIVERY_ERROR",
            Self::Processing(_) => "PROCESSING_ERROR",
        }
    }
}

pub trait TimedOut {
    fn timed_out(limit: Duration) -> Self;
}

impl TimedOut for StorageError {
    fn timed_out(limit: Duration) -> Self {
        Self::Timeout(limit)
    }
}

impl TimedOut for PersistenceError {
    fn timed_out(limit: Duration) -> Self {
        Self::Timeout(limit)
    }
}

impl TimedOut for DeliveryError {
    fn timed_out(limit: Duration) -> Self {
        Self::Timeout(limit)
    }
}

impl TimedOut for ProcessingError {
    fn timed_out(limit: Duration) -> Self {
        Self::Timeout(limit)
    }
}

/// Runs one external call under an upper bound. An elapsed timer becomes the
/// step's own timeout error so callers handle it like any other failure.
pub async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: TimedOut,
{
    match timeout(limit, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(E::timed_out(limit)),
    }
}
