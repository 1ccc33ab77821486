use disco_storage::PersistenceError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("job payload error: {0}")]
    Parse(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("invalid schedule {cron}: {message}")]
    InvalidSchedule { cron: String, message: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
