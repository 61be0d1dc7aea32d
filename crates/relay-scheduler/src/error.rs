use thiserror::Error;

/// Errors raised by the cron store and tick loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job not found: {id}")]
    JobNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
