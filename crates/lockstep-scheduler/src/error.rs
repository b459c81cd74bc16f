//! Scheduler error types.

use lockstep_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Why a job's inputs could not be resolved.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No combination of versions satisfies every passed constraint.
    #[error("no consistent version set")]
    Unresolved,

    #[error(transparent)]
    Db(#[from] DbError),
}
