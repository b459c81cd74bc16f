//! Serial-group admission.

use lockstep_core::{Admission, AdmissionRequest, BuildId, Job};
use lockstep_db::BuildRepo;
use std::sync::Arc;
use tracing::{debug, info};

use crate::SchedulerResult;

/// Decides whether a pending build may start.
///
/// The check and the transition to started happen atomically in the store;
/// a `false` answer means "try again later".
pub struct SerialScheduler {
    builds: Arc<dyn BuildRepo>,
}

impl SerialScheduler {
    pub fn new(builds: Arc<dyn BuildRepo>) -> Self {
        Self { builds }
    }

    /// Try to start a build of `job`. Serial semantics apply when the job is
    /// serial or the caller asks for them.
    pub async fn try_admit(&self, job: &Job, build_id: BuildId, serial: bool) -> SchedulerResult<bool> {
        self.try_admit_with_abort_url(job, build_id, serial, None)
            .await
    }

    /// Like [`try_admit`](Self::try_admit), recording where abort requests
    /// for the started build should be sent.
    pub async fn try_admit_with_abort_url(
        &self,
        job: &Job,
        build_id: BuildId,
        serial: bool,
        abort_url: Option<String>,
    ) -> SchedulerResult<bool> {
        let serial_groups = if serial || job.is_serial() {
            job.effective_serial_groups()
        } else {
            Vec::new()
        };

        let request = AdmissionRequest {
            build_id,
            pipeline_id: Some(job.pipeline_id),
            serial_groups,
            abort_url,
        };

        match self.builds.admit(&request).await? {
            Admission::Admitted => {
                info!(job = %job.name, build_id = %build_id, "Build started");
                Ok(true)
            }
            Admission::NotPending(status) => {
                debug!(job = %job.name, build_id = %build_id, %status, "Build is not pending");
                Ok(false)
            }
            Admission::Busy { holder } => {
                debug!(job = %job.name, build_id = %build_id, holder = %holder, "Serial group busy");
                Ok(false)
            }
            Admission::Queued { ahead } => {
                debug!(job = %job.name, build_id = %build_id, ahead = %ahead, "Older build goes first");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{BuildStatus, JobConfig, Pipeline, PipelineConfig, ResourceConfig};
    use lockstep_db::{MemoryStore, PipelineRepo, TeamRepo};

    async fn setup() -> (Arc<MemoryStore>, Pipeline, SerialScheduler) {
        let store = Arc::new(MemoryStore::new());
        let team = store.create_team("main").await.unwrap();
        let config = PipelineConfig {
            name: "some-pipeline".to_string(),
            resources: vec![ResourceConfig {
                name: "repo".to_string(),
                resource_type: "git".to_string(),
            }],
            jobs: vec![
                JobConfig::new("some-job"),
                JobConfig {
                    serial: true,
                    ..JobConfig::new("serial-job")
                },
                JobConfig {
                    serial_groups: vec!["prod".to_string()],
                    ..JobConfig::new("deploy-web")
                },
                JobConfig {
                    serial_groups: vec!["prod".to_string()],
                    ..JobConfig::new("deploy-db")
                },
            ],
        };
        let pipeline = store.save_pipeline(team.id, &config).await.unwrap();
        let scheduler = SerialScheduler::new(store.clone());
        (store, pipeline, scheduler)
    }

    async fn job(store: &MemoryStore, pipeline: &Pipeline, name: &str) -> Job {
        store.job(pipeline.id, name).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_serial_build_waits_for_previous_build() {
        let (store, pipeline, scheduler) = setup().await;
        let job = job(&store, &pipeline, "serial-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();

        // Second build cannot jump ahead of a pending first build.
        assert!(!scheduler.try_admit(&job, two.id, false).await.unwrap());

        assert!(scheduler.try_admit(&job, one.id, false).await.unwrap());
        assert!(!scheduler.try_admit(&job, two.id, false).await.unwrap());

        store.finish(one.id, BuildStatus::Succeeded).await.unwrap();
        assert!(scheduler.try_admit(&job, two.id, false).await.unwrap());

        let started = store.build(two.id).await.unwrap().unwrap();
        assert_eq!(started.status, BuildStatus::Started);
        assert!(started.scheduled);
        assert!(started.started_at.is_some());
    }

    #[tokio::test]
    async fn test_aborting_the_first_build_lets_the_second_run() {
        let (store, pipeline, scheduler) = setup().await;
        let job = job(&store, &pipeline, "serial-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();
        let three = store.create_job_build(&job).await.unwrap();

        scheduler.try_admit(&job, one.id, false).await.unwrap();
        store.abort(one.id).await.unwrap();

        assert!(!scheduler.try_admit(&job, three.id, false).await.unwrap());
        assert!(scheduler.try_admit(&job, two.id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_serial_job_runs_concurrently() {
        let (store, pipeline, scheduler) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();

        assert!(scheduler.try_admit(&job, two.id, false).await.unwrap());
        assert!(scheduler.try_admit(&job, one.id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_caller_can_request_serial_admission() {
        let (store, pipeline, scheduler) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();

        assert!(scheduler.try_admit(&job, one.id, true).await.unwrap());
        assert!(!scheduler.try_admit(&job, two.id, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_serial_groups_exclude_across_jobs() {
        let (store, pipeline, scheduler) = setup().await;
        let web = job(&store, &pipeline, "deploy-web").await;
        let db = job(&store, &pipeline, "deploy-db").await;
        let web_build = store.create_job_build(&web).await.unwrap();
        let db_build = store.create_job_build(&db).await.unwrap();

        assert!(scheduler.try_admit(&web, web_build.id, false).await.unwrap());
        assert!(!scheduler.try_admit(&db, db_build.id, false).await.unwrap());

        // Unrelated jobs are unaffected.
        let other = job(&store, &pipeline, "serial-job").await;
        let other_build = store.create_job_build(&other).await.unwrap();
        assert!(scheduler.try_admit(&other, other_build.id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_aborted_build_is_never_admitted() {
        let (store, pipeline, scheduler) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let build = store.create_job_build(&job).await.unwrap();
        store.abort(build.id).await.unwrap();

        assert!(!scheduler.try_admit(&job, build.id, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_url_is_recorded() {
        let (store, pipeline, scheduler) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let build = store.create_job_build(&job).await.unwrap();

        scheduler
            .try_admit_with_abort_url(&job, build.id, false, Some("http://abort".to_string()))
            .await
            .unwrap();
        assert_eq!(
            store.abort(build.id).await.unwrap().as_deref(),
            Some("http://abort")
        );
    }
}
