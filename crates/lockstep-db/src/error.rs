//! Database error types.

use lockstep_core::BuildStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<lockstep_core::Error> for DbError {
    fn from(err: lockstep_core::Error) -> Self {
        match err {
            lockstep_core::Error::NotFound(what) => DbError::NotFound(what),
            lockstep_core::Error::InvalidInput(what) => DbError::InvalidInput(what),
            lockstep_core::Error::InvalidTransition { from, to } => {
                DbError::InvalidTransition { from, to }
            }
            lockstep_core::Error::Conflict(what) => DbError::Duplicate(what),
            other => DbError::Corrupt(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
