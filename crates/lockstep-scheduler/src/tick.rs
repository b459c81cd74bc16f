//! Per-job scheduling tick.
//!
//! One tick resolves the job's inputs, creates a build when the resolved
//! set has not been built yet, and tries to start the oldest pending build.

use lockstep_core::{Build, BuildId, Job, VersionedResource};
use lockstep_db::{BuildRepo, VersionRepo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{ResolveError, SchedulerResult, SerialScheduler, VersionResolver};

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Build created for a new set of input versions.
    pub created: Option<Build>,
    /// Build moved from pending to started.
    pub started: Option<BuildId>,
}

/// Drives a job forward: resolve, create, admit.
pub struct JobScheduler {
    builds: Arc<dyn BuildRepo>,
    versions: Arc<dyn VersionRepo>,
    resolver: VersionResolver,
    serial: SerialScheduler,
}

impl JobScheduler {
    pub fn new(builds: Arc<dyn BuildRepo>, versions: Arc<dyn VersionRepo>) -> Self {
        Self {
            resolver: VersionResolver::new(versions.clone()),
            serial: SerialScheduler::new(builds.clone()),
            builds,
            versions,
        }
    }

    pub async fn tick(&self, job: &Job) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();

        if job.inputs.is_empty() {
            debug!(job = %job.name, "Job has no inputs to trigger on");
        } else {
            report.created = self.create_for_new_inputs(job).await?;
        }

        if let Some((build, inputs)) = self.builds.next_pending_build(job.id).await? {
            if self.serial.try_admit(job, build.id, false).await? {
                info!(
                    job = %job.name,
                    build = %build.name,
                    inputs = inputs.len(),
                    "Scheduled build"
                );
                report.started = Some(build.id);
            }
        }

        Ok(report)
    }

    async fn create_for_new_inputs(&self, job: &Job) -> SchedulerResult<Option<Build>> {
        let resolved = match self.resolver.resolve(job.pipeline_id, &job.inputs).await {
            Ok(resolved) => resolved,
            Err(ResolveError::Unresolved) => {
                debug!(job = %job.name, "Inputs not ready");
                return Ok(None);
            }
            Err(ResolveError::Db(e)) => return Err(e.into()),
        };

        let inputs: Vec<(String, VersionedResource)> = resolved
            .into_iter()
            .map(|r| (r.name, r.versioned_resource))
            .collect();

        if let Some(existing) = self.versions.job_build_for_inputs(job.id, &inputs).await? {
            debug!(job = %job.name, build = %existing.name, "Inputs already built");
            return Ok(None);
        }

        let build = self
            .builds
            .create_job_build_with_inputs(job, &inputs)
            .await?;
        info!(job = %job.name, build = %build.name, "Created build for new inputs");
        Ok(Some(build))
    }
}
