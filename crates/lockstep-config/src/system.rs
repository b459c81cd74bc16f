//! System configuration parsing.
//!
//! ```kdl
//! database-url "postgres://lockstep@127.0.0.1:5432/lockstep"
//! sweep-interval "30s"
//!
//! retention {
//!     grace "5m"
//!     failed-grace "120h"
//! }
//! ```

use crate::kdl_util::get_first_string_arg;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d)$").expect("valid regex"));

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// PostgreSQL connection string. Command line and environment override it.
    pub database_url: Option<String>,
    /// Time between retention sweeps.
    pub sweep_interval: Duration,
    pub retention: RetentionConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sweep_interval: Duration::from_secs(30),
            retention: RetentionConfig::default(),
        }
    }
}

/// How long completed builds stay interceptible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Window for aborted, errored and one-off succeeded builds.
    pub grace: Duration,
    /// Window for failed builds.
    pub failed_grace: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5 * 60),
            failed_grace: Duration::from_secs(120 * 60 * 60),
        }
    }
}

/// Parse system configuration from KDL text. Missing nodes keep defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database-url" => {
                config.database_url = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("database-url".to_string()))?,
                );
            }
            "sweep-interval" => {
                config.sweep_interval = duration_arg(node, "sweep-interval")?;
            }
            "retention" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "grace" => config.retention.grace = duration_arg(child, "grace")?,
                            "failed-grace" => {
                                config.retention.failed_grace =
                                    duration_arg(child, "failed-grace")?
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if config.sweep_interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "sweep-interval".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(config)
}

/// Read and parse a system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse durations such as `500ms`, `30s`, `5m`, `2h` or `1d`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let caps = DURATION_RE.captures(value.trim())?;
    let amount: u64 = caps[1].parse().ok()?;

    let duration = match &caps[2] {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        "h" => Duration::from_secs(amount.checked_mul(60 * 60)?),
        "d" => Duration::from_secs(amount.checked_mul(24 * 60 * 60)?),
        _ => return None,
    };
    Some(duration)
}

fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let raw = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    parse_duration(&raw).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("invalid duration: {}", raw),
    })
}
