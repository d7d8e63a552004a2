use thiserror::Error;

use crate::scheduler::job::{JobId, UserId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Slot {0} is not idle")]
    SlotBusy(usize),

    #[error("User {0} already occupies a slot")]
    UserBusy(UserId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
