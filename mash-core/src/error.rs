use thiserror::Error;

#[derive(Error, Debug)]
pub enum MashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already scheduled: {0}")]
    AlreadyScheduled(String),

    #[error("Message to exchange `{exchange}` with key `{routing_key}` is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for MashError {
    fn from(err: redis::RedisError) -> Self {
        MashError::Broker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MashError>;
