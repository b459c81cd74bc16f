//! Serial-group admission rule.
//!
//! Stores evaluate [`decide`] inside whatever atomic section guards the
//! candidate's serial groups, so the check and the resulting transition to
//! `Started` cannot interleave with a competing admission.

use serde::{Deserialize, Serialize};

use crate::{Build, BuildId, BuildStatus, PipelineId};

/// What the caller asks the store to admit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub build_id: BuildId,
    pub pipeline_id: Option<PipelineId>,
    /// Serial groups to enforce. Empty means unbounded concurrency.
    pub serial_groups: Vec<String>,
    /// Abort endpoint to record when the build starts.
    pub abort_url: Option<String>,
}

impl AdmissionRequest {
    pub fn is_serial(&self) -> bool {
        !self.serial_groups.is_empty()
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    /// The build is now scheduled and started.
    Admitted,
    /// The build is no longer pending.
    NotPending(BuildStatus),
    /// Another build in a shared serial group holds the slot.
    Busy { holder: BuildId },
    /// An older pending build in a shared serial group goes first.
    Queued { ahead: BuildId },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Decide whether `candidate` may start.
///
/// `group_builds` holds the non-terminal builds of every job sharing one of
/// the candidate's serial groups. It may include the candidate itself. For
/// non-serial admission pass an empty slice.
pub fn decide(candidate: &Build, group_builds: &[Build]) -> Admission {
    if candidate.status != BuildStatus::Pending {
        return Admission::NotPending(candidate.status);
    }

    let others = group_builds
        .iter()
        .filter(|b| b.id != candidate.id && !b.status.is_terminal());

    if let Some(holder) = others
        .clone()
        .find(|b| b.scheduled || b.status == BuildStatus::Started)
    {
        return Admission::Busy { holder: holder.id };
    }

    if let Some(ahead) = others
        .filter(|b| b.status == BuildStatus::Pending && !b.scheduled && b.id < candidate.id)
        .min_by_key(|b| b.id)
    {
        return Admission::Queued { ahead: ahead.id };
    }

    Admission::Admitted
}
