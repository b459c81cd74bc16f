//! Retention sweep: releasing finished builds from interception.
//!
//! A finished build stays interceptible (its containers kept around for
//! debugging) until the sweep decides nobody will want to look at it again.

use chrono::{DateTime, TimeDelta, Utc};
use lockstep_config::RetentionConfig;
use lockstep_core::{Build, BuildId, BuildStatus};
use lockstep_db::BuildRepo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::SchedulerResult;

/// Grace windows measured from a build's end time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    grace: TimeDelta,
    failed_grace: TimeDelta,
}

impl From<RetentionConfig> for RetentionPolicy {
    fn from(config: RetentionConfig) -> Self {
        Self {
            grace: TimeDelta::from_std(config.grace).unwrap_or(TimeDelta::MAX),
            failed_grace: TimeDelta::from_std(config.failed_grace).unwrap_or(TimeDelta::MAX),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionConfig::default().into()
    }
}

impl RetentionPolicy {
    fn window(&self, status: BuildStatus) -> TimeDelta {
        match status {
            BuildStatus::Failed => self.failed_grace,
            _ => self.grace,
        }
    }

    fn window_elapsed(&self, build: &Build, now: DateTime<Utc>) -> bool {
        let ended = build.ended_at.unwrap_or(build.created_at);
        now - ended > self.window(build.status)
    }

    /// Whether a build should stop being interceptible at `now`.
    ///
    /// `is_latest` tells whether this is the most recent finished build of
    /// its job; it is ignored for one-off builds.
    pub fn should_release(&self, build: &Build, is_latest: bool, now: DateTime<Utc>) -> bool {
        if !build.status.is_terminal() || !build.interceptible {
            return false;
        }

        if build.is_one_off() {
            return self.window_elapsed(build, now);
        }

        if !is_latest || build.status == BuildStatus::Succeeded {
            return true;
        }

        self.window_elapsed(build, now)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Finished, still interceptible builds looked at.
    pub examined: usize,
    /// Builds flipped to non-interceptible.
    pub released: Vec<BuildId>,
    /// Builds whose flip failed; the next sweep retries them.
    pub failed: Vec<BuildId>,
}

/// Runs the retention policy against the store.
pub struct RetentionSweeper {
    builds: Arc<dyn BuildRepo>,
    policy: RetentionPolicy,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(builds: Arc<dyn BuildRepo>, policy: RetentionPolicy, interval: Duration) -> Self {
        Self {
            builds,
            policy,
            interval,
        }
    }

    pub async fn sweep(&self) -> SchedulerResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SchedulerResult<SweepReport> {
        let candidates = self.builds.interceptible_completed_builds().await?;
        let latest: HashSet<BuildId> = self
            .builds
            .latest_completed_build_ids()
            .await?
            .into_iter()
            .collect();

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for build in &candidates {
            if !self
                .policy
                .should_release(build, latest.contains(&build.id), now)
            {
                continue;
            }

            match self.builds.mark_non_interceptible(build.id).await {
                Ok(true) => {
                    debug!(build_id = %build.id, status = %build.status, "Build no longer interceptible");
                    report.released.push(build.id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "Failed to release build");
                    report.failed.push(build.id);
                }
            }
        }

        Ok(report)
    }

    /// Sweep forever, once per interval.
    pub async fn run(&self) {
        info!(interval = ?self.interval, "Starting retention sweeper");

        loop {
            match self.sweep().await {
                Ok(report) if !report.released.is_empty() || !report.failed.is_empty() => {
                    info!(
                        examined = report.examined,
                        released = report.released.len(),
                        failed = report.failed.len(),
                        "Retention sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
            sleep(self.interval).await;
        }
    }
}
