//! KDL configuration parsing for Lockstep.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (jobs, resources, serial groups, passed constraints)
//! - System configuration (database, retention windows, sweep interval)

pub mod error;
mod kdl_util;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_pipeline;
pub use system::{
    RetentionConfig, SystemConfig, load_system_config, parse_duration, parse_system_config,
};
