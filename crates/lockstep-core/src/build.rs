//! Builds and the build status state machine.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{BuildId, Error, JobId, PipelineId, Result, TeamId, VersionedResource};

/// Status of a build.
///
/// ```text
/// Pending -> Started -> Succeeded | Failed | Errored
/// Pending -> Aborted
/// Started -> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[display("pending")]
    Pending,
    #[display("started")]
    Started,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("errored")]
    Errored,
    #[display("aborted")]
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    /// Validate a transition, returning the new status.
    pub fn transition(self, to: BuildStatus) -> Result<BuildStatus> {
        use BuildStatus::*;

        let allowed = match (self, to) {
            (Pending, Started) | (Pending, Aborted) => true,
            (Started, Succeeded) | (Started, Failed) | (Started, Errored) | (Started, Aborted) => {
                true
            }
            _ => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(Error::InvalidTransition { from: self, to })
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(Error::InvalidInput(format!("unknown build status: {other}"))),
        }
    }
}

/// A single execution of a job, or a one-off execution owned by a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    /// Per-job sequence name ("1", "2", ...). One-off builds use their id.
    pub name: String,
    pub team_id: TeamId,
    pub pipeline_id: Option<PipelineId>,
    pub job_id: Option<JobId>,
    pub job_name: Option<String>,
    pub status: BuildStatus,
    /// Set once the build has been admitted by the scheduler.
    pub scheduled: bool,
    pub interceptible: bool,
    pub drained: bool,
    /// Endpoint the execution environment listens on for abort requests.
    pub abort_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job_id.is_none()
    }

    /// Whether an abort request still has something to stop.
    pub fn is_abortable(&self) -> bool {
        matches!(self.status, BuildStatus::Pending | BuildStatus::Started)
    }
}

/// A versioned resource consumed by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    /// Name the job gave this input.
    pub name: String,
    pub versioned_resource: VersionedResource,
    /// True if no other build of the same job consumed this version before.
    pub first_occurrence: bool,
}

/// A versioned resource produced by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub versioned_resource: VersionedResource,
}
