//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("job '{job}' gets unknown resource '{resource}'")]
    UnknownResource { job: String, resource: String },

    #[error("input '{input}' of job '{job}' passed unknown job '{upstream}'")]
    UnknownPassedJob {
        job: String,
        input: String,
        upstream: String,
    },

    #[error("passed constraints form a cycle: {0}")]
    PassedCycle(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
