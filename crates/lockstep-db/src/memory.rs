//! In-memory execution store.
//!
//! Every table lives behind a single async mutex, so each repository call is
//! one atomic section. Semantics match the PostgreSQL repositories.

use async_trait::async_trait;
use chrono::Utc;
use lockstep_core::page::paginate;
use lockstep_core::{
    Admission, AdmissionRequest, Build, BuildId, BuildInput, BuildOutput, BuildStatus, Job, JobId,
    JobInput, OutputRecord, Page, Pagination, Pipeline, PipelineConfig, PipelineId, Team, TeamId,
    VersionHistory, VersionId, VersionRecord, VersionedResource, VisibilityScope, admission,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

use crate::{
    BuildRepo, BuildResources, DbError, DbResult, LogRepo, PipelineRepo, TeamRepo, VersionRepo,
};

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    build_number_seq: i64,
}

#[derive(Debug, Clone)]
struct StoredResource {
    pipeline_id: PipelineId,
    name: String,
}

#[derive(Debug, Clone)]
struct StoredVersion {
    pipeline_id: PipelineId,
    record: VersionRecord,
}

#[derive(Debug, Clone)]
struct StoredInput {
    build_id: BuildId,
    version_id: VersionId,
    name: String,
}

#[derive(Debug, Default)]
struct Sequences {
    team: i64,
    pipeline: i64,
    job: i64,
    version: i64,
    check_order: i64,
    build: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Debug, Default)]
struct State {
    seq: Sequences,
    teams: Vec<Team>,
    pipelines: Vec<Pipeline>,
    jobs: Vec<StoredJob>,
    resources: Vec<StoredResource>,
    versions: Vec<StoredVersion>,
    builds: BTreeMap<BuildId, Build>,
    inputs: Vec<StoredInput>,
    outputs: Vec<(BuildId, VersionId)>,
    logs: HashMap<BuildId, String>,
}

impl State {
    fn job(&self, id: JobId) -> Option<&StoredJob> {
        self.jobs.iter().find(|j| j.job.id == id)
    }

    fn build(&self, id: BuildId) -> DbResult<&Build> {
        self.builds
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn build_mut(&mut self, id: BuildId) -> DbResult<&mut Build> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn version(&self, id: VersionId) -> Option<&VersionRecord> {
        self.versions
            .iter()
            .find(|v| v.record.id == id)
            .map(|v| &v.record)
    }

    fn find_version(
        &self,
        pipeline_id: PipelineId,
        versioned_resource: &VersionedResource,
    ) -> Option<VersionId> {
        self.versions
            .iter()
            .find(|v| {
                v.pipeline_id == pipeline_id
                    && v.record.versioned_resource.same_identity(versioned_resource)
            })
            .map(|v| v.record.id)
    }

    /// Only `make_latest` moves an already known version to the front.
    fn upsert_version(
        &mut self,
        pipeline_id: PipelineId,
        versioned_resource: &VersionedResource,
        make_latest: bool,
    ) -> DbResult<VersionId> {
        let registered = self
            .resources
            .iter()
            .any(|r| r.pipeline_id == pipeline_id && r.name == versioned_resource.resource);
        if !registered {
            return Err(DbError::NotFound(format!(
                "resource {} in pipeline {}",
                versioned_resource.resource, pipeline_id
            )));
        }

        if let Some(pos) = self.versions.iter().position(|v| {
            v.pipeline_id == pipeline_id
                && v.record.versioned_resource.same_identity(versioned_resource)
        }) {
            let check_order = if make_latest {
                next(&mut self.seq.check_order)
            } else {
                self.versions[pos].record.check_order
            };
            let existing = &mut self.versions[pos];
            existing.record.check_order = check_order;
            existing.record.versioned_resource = versioned_resource.clone();
            return Ok(existing.record.id);
        }

        let check_order = next(&mut self.seq.check_order);

        let id = VersionId::new(next(&mut self.seq.version));
        self.versions.push(StoredVersion {
            pipeline_id,
            record: VersionRecord {
                id,
                check_order,
                versioned_resource: versioned_resource.clone(),
            },
        });
        Ok(id)
    }

    fn insert_job_build(&mut self, job_id: JobId) -> DbResult<BuildId> {
        let stored = self
            .jobs
            .iter_mut()
            .find(|j| j.job.id == job_id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job_id)))?;
        stored.build_number_seq += 1;
        let number = stored.build_number_seq;
        let job = stored.job.clone();

        let team_id = self
            .pipelines
            .iter()
            .find(|p| p.id == job.pipeline_id)
            .map(|p| p.team_id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", job.pipeline_id)))?;

        let id = BuildId::new(next(&mut self.seq.build));
        self.builds.insert(
            id,
            new_build(id, number.to_string(), team_id, Some(&job)),
        );
        Ok(id)
    }

    /// Pipeline of a job build; one-off builds cannot record versions.
    fn build_pipeline(&self, build_id: BuildId) -> DbResult<PipelineId> {
        self.build(build_id)?.pipeline_id.ok_or_else(|| {
            DbError::InvalidInput(format!(
                "one-off build {} cannot record resource versions",
                build_id
            ))
        })
    }

    fn first_occurrence(&self, build: &Build, version_id: VersionId) -> bool {
        !self.inputs.iter().any(|input| {
            input.version_id == version_id
                && input.build_id < build.id
                && self
                    .builds
                    .get(&input.build_id)
                    .is_some_and(|other| other.job_id.is_some() && other.job_id == build.job_id)
        })
    }

    fn inputs_of(&self, build_id: BuildId) -> DbResult<Vec<BuildInput>> {
        let build = self.build(build_id)?;
        let mut inputs: Vec<BuildInput> = self
            .inputs
            .iter()
            .filter(|i| i.build_id == build_id)
            .filter_map(|i| {
                self.version(i.version_id).map(|v| BuildInput {
                    name: i.name.clone(),
                    versioned_resource: v.versioned_resource.clone(),
                    first_occurrence: self.first_occurrence(build, i.version_id),
                })
            })
            .collect();
        inputs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(inputs)
    }

    fn visible(&self, build: &Build, scope: &VisibilityScope) -> bool {
        let public = build
            .pipeline_id
            .and_then(|id| self.pipelines.iter().find(|p| p.id == id))
            .is_some_and(|p| p.public);

        match scope {
            VisibilityScope::All => true,
            VisibilityScope::Public => public,
            VisibilityScope::Teams(names) => {
                public
                    || self
                        .teams
                        .iter()
                        .any(|t| t.id == build.team_id && names.contains(&t.name))
            }
        }
    }
}

fn new_build(id: BuildId, name: String, team_id: TeamId, job: Option<&Job>) -> Build {
    Build {
        id,
        name,
        team_id,
        pipeline_id: job.map(|j| j.pipeline_id),
        job_id: job.map(|j| j.id),
        job_name: job.map(|j| j.name.clone()),
        status: BuildStatus::Pending,
        scheduled: false,
        interceptible: true,
        drained: false,
        abort_url: None,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
    }
}

/// Execution store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TeamRepo for MemoryStore {
    async fn create_team(&self, name: &str) -> DbResult<Team> {
        let mut state = self.state.lock().await;
        if state.teams.iter().any(|t| t.name == name) {
            return Err(DbError::Duplicate(format!("team {}", name)));
        }
        let team = Team {
            id: TeamId::new(next(&mut state.seq.team)),
            name: name.to_string(),
        };
        state.teams.push(team.clone());
        Ok(team)
    }

    async fn team_by_name(&self, name: &str) -> DbResult<Option<Team>> {
        let state = self.state.lock().await;
        Ok(state.teams.iter().find(|t| t.name == name).cloned())
    }

    async fn teams(&self) -> DbResult<Vec<Team>> {
        let state = self.state.lock().await;
        let mut teams = state.teams.clone();
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }
}

#[async_trait]
impl PipelineRepo for MemoryStore {
    async fn save_pipeline(&self, team_id: TeamId, config: &PipelineConfig) -> DbResult<Pipeline> {
        let mut state = self.state.lock().await;
        if !state.teams.iter().any(|t| t.id == team_id) {
            return Err(DbError::NotFound(format!("team {}", team_id)));
        }

        let pipeline = match state
            .pipelines
            .iter()
            .find(|p| p.team_id == team_id && p.name == config.name)
        {
            Some(existing) => existing.clone(),
            None => {
                let pipeline = Pipeline {
                    id: PipelineId::new(next(&mut state.seq.pipeline)),
                    team_id,
                    name: config.name.clone(),
                    public: false,
                };
                state.pipelines.push(pipeline.clone());
                pipeline
            }
        };

        for resource in &config.resources {
            let known = state
                .resources
                .iter()
                .any(|r| r.pipeline_id == pipeline.id && r.name == resource.name);
            if !known {
                state.resources.push(StoredResource {
                    pipeline_id: pipeline.id,
                    name: resource.name.clone(),
                });
            }
        }

        for job in &config.jobs {
            if let Some(stored) = state
                .jobs
                .iter_mut()
                .find(|j| j.job.pipeline_id == pipeline.id && j.job.name == job.name)
            {
                stored.job.serial = job.serial;
                stored.job.serial_groups = job.serial_groups.clone();
                stored.job.inputs = job.inputs.clone();
                continue;
            }

            let id = JobId::new(next(&mut state.seq.job));
            state.jobs.push(StoredJob {
                job: Job {
                    id,
                    pipeline_id: pipeline.id,
                    name: job.name.clone(),
                    serial: job.serial,
                    serial_groups: job.serial_groups.clone(),
                    inputs: job.inputs.clone(),
                },
                build_number_seq: 0,
            });
        }

        Ok(pipeline)
    }

    async fn pipeline(&self, team_id: TeamId, name: &str) -> DbResult<Option<Pipeline>> {
        let state = self.state.lock().await;
        Ok(state
            .pipelines
            .iter()
            .find(|p| p.team_id == team_id && p.name == name)
            .cloned())
    }

    async fn set_public(&self, pipeline_id: PipelineId, public: bool) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let pipeline = state
            .pipelines
            .iter_mut()
            .find(|p| p.id == pipeline_id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", pipeline_id)))?;
        pipeline.public = public;
        Ok(())
    }

    async fn job(&self, pipeline_id: PipelineId, name: &str) -> DbResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .find(|j| j.job.pipeline_id == pipeline_id && j.job.name == name)
            .map(|j| j.job.clone()))
    }

    async fn job_by_id(&self, job_id: JobId) -> DbResult<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.job(job_id).map(|j| j.job.clone()))
    }

    async fn jobs(&self, pipeline_id: PipelineId) -> DbResult<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.job.pipeline_id == pipeline_id)
            .map(|j| j.job.clone())
            .collect())
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_one_off(&self, team_id: TeamId) -> DbResult<Build> {
        let mut state = self.state.lock().await;
        let id = BuildId::new(next(&mut state.seq.build));
        let build = new_build(id, id.to_string(), team_id, None);
        state.builds.insert(id, build.clone());
        Ok(build)
    }

    async fn create_job_build(&self, job: &Job) -> DbResult<Build> {
        let mut state = self.state.lock().await;
        let id = state.insert_job_build(job.id)?;
        Ok(state.build(id)?.clone())
    }

    async fn create_job_build_with_inputs(
        &self,
        job: &Job,
        inputs: &[(String, VersionedResource)],
    ) -> DbResult<Build> {
        let mut state = self.state.lock().await;

        // Validate every input before touching any table.
        for (_, versioned_resource) in inputs {
            let registered = state.resources.iter().any(|r| {
                r.pipeline_id == job.pipeline_id && r.name == versioned_resource.resource
            });
            if !registered {
                return Err(DbError::NotFound(format!(
                    "resource {} in pipeline {}",
                    versioned_resource.resource, job.pipeline_id
                )));
            }
        }

        let id = state.insert_job_build(job.id)?;
        for (name, versioned_resource) in inputs {
            let version_id = state.upsert_version(job.pipeline_id, versioned_resource, false)?;
            state.inputs.push(StoredInput {
                build_id: id,
                version_id,
                name: name.clone(),
            });
        }
        Ok(state.build(id)?.clone())
    }

    async fn build(&self, id: BuildId) -> DbResult<Option<Build>> {
        let state = self.state.lock().await;
        Ok(state.builds.get(&id).cloned())
    }

    async fn job_build(&self, job_id: JobId, name: &str) -> DbResult<Option<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .find(|b| b.job_id == Some(job_id) && b.name == name)
            .cloned())
    }

    async fn job_builds(&self, job_id: JobId) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .rev()
            .filter(|b| b.job_id == Some(job_id))
            .cloned()
            .collect())
    }

    async fn next_pending_build(
        &self,
        job_id: JobId,
    ) -> DbResult<Option<(Build, Vec<BuildInput>)>> {
        let state = self.state.lock().await;
        let Some(build) = state
            .builds
            .values()
            .find(|b| b.job_id == Some(job_id) && b.status == BuildStatus::Pending)
        else {
            return Ok(None);
        };
        let inputs = state.inputs_of(build.id)?;
        Ok(Some((build.clone(), inputs)))
    }

    async fn current_build(&self, job_id: JobId) -> DbResult<Option<Build>> {
        let state = self.state.lock().await;
        let mut builds = state.builds.values().filter(|b| b.job_id == Some(job_id));

        let started = builds
            .clone()
            .filter(|b| b.status == BuildStatus::Started)
            .max_by_key(|b| b.id);
        let pending = builds
            .clone()
            .filter(|b| b.status == BuildStatus::Pending)
            .min_by_key(|b| b.id);
        let newest = builds.next_back();

        Ok(started.or(pending).or(newest).cloned())
    }

    async fn admit(&self, request: &AdmissionRequest) -> DbResult<Admission> {
        let mut state = self.state.lock().await;
        let candidate = state.build(request.build_id)?.clone();

        let group_builds: Vec<Build> = match request.pipeline_id {
            Some(pipeline_id) if request.is_serial() => state
                .builds
                .values()
                .filter(|b| b.pipeline_id == Some(pipeline_id) && !b.status.is_terminal())
                .filter(|b| {
                    b.job_id
                        .and_then(|id| state.job(id))
                        .is_some_and(|j| j.job.shares_group_with(&request.serial_groups))
                })
                .cloned()
                .collect(),
            _ => Vec::new(),
        };

        let decision = admission::decide(&candidate, &group_builds);
        if decision.is_admitted() {
            let build = state.build_mut(request.build_id)?;
            build.status = BuildStatus::Started;
            build.scheduled = true;
            build.started_at = Some(Utc::now());
            if let Some(url) = &request.abort_url {
                build.abort_url = Some(url.clone());
            }
        }
        Ok(decision)
    }

    async fn finish(&self, id: BuildId, status: BuildStatus) -> DbResult<Build> {
        if !status.is_terminal() {
            return Err(DbError::InvalidInput(format!(
                "cannot finish build {} as {}",
                id, status
            )));
        }

        let mut state = self.state.lock().await;
        let build = state.build_mut(id)?;
        build.status = build.status.transition(status)?;
        build.ended_at = Some(Utc::now());
        Ok(build.clone())
    }

    async fn abort(&self, id: BuildId) -> DbResult<Option<String>> {
        let mut state = self.state.lock().await;
        let build = state.build_mut(id)?;
        if !build.is_abortable() {
            return Ok(None);
        }
        build.status = BuildStatus::Aborted;
        build.ended_at = Some(Utc::now());
        Ok(build.abort_url.clone())
    }

    async fn set_drained(&self, id: BuildId, drained: bool) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.build_mut(id)?.drained = drained;
        Ok(())
    }

    async fn drainable_builds(&self) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .filter(|b| b.status.is_terminal() && !b.drained)
            .cloned()
            .collect())
    }

    async fn started_builds(&self) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .filter(|b| b.status == BuildStatus::Started)
            .cloned()
            .collect())
    }

    async fn interceptible_completed_builds(&self) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .filter(|b| b.interceptible && b.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn latest_completed_build_ids(&self) -> DbResult<Vec<BuildId>> {
        let state = self.state.lock().await;
        let mut latest: HashMap<JobId, BuildId> = HashMap::new();
        for build in state.builds.values().filter(|b| b.status.is_terminal()) {
            if let Some(job_id) = build.job_id {
                let entry = latest.entry(job_id).or_insert(build.id);
                *entry = (*entry).max(build.id);
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn mark_non_interceptible(&self, id: BuildId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let build = state.build_mut(id)?;
        let changed = build.interceptible;
        build.interceptible = false;
        Ok(changed)
    }

    async fn builds(
        &self,
        scope: &VisibilityScope,
        page: &Page,
    ) -> DbResult<(Vec<Build>, Pagination)> {
        let state = self.state.lock().await;
        let visible: Vec<Build> = state
            .builds
            .values()
            .filter(|b| state.visible(b, scope))
            .cloned()
            .collect();
        Ok(paginate(visible, page))
    }
}

#[async_trait]
impl VersionRepo for MemoryStore {
    async fn save_versioned_resource(
        &self,
        pipeline_id: PipelineId,
        versioned_resource: &VersionedResource,
    ) -> DbResult<VersionId> {
        let mut state = self.state.lock().await;
        state.upsert_version(pipeline_id, versioned_resource, true)
    }

    async fn latest_versioned_resource(
        &self,
        pipeline_id: PipelineId,
        resource: &str,
    ) -> DbResult<Option<VersionedResource>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .filter(|v| {
                v.pipeline_id == pipeline_id && v.record.versioned_resource.resource == resource
            })
            .max_by_key(|v| v.record.check_order)
            .map(|v| v.record.versioned_resource.clone()))
    }

    async fn save_build_input(
        &self,
        build_id: BuildId,
        name: &str,
        versioned_resource: &VersionedResource,
    ) -> DbResult<BuildInput> {
        let mut state = self.state.lock().await;
        let pipeline_id = state.build_pipeline(build_id)?;
        let version_id = state.upsert_version(pipeline_id, versioned_resource, false)?;

        let exists = state
            .inputs
            .iter()
            .any(|i| i.build_id == build_id && i.version_id == version_id && i.name == name);
        if !exists {
            state.inputs.push(StoredInput {
                build_id,
                version_id,
                name: name.to_string(),
            });
        }

        let build = state.build(build_id)?;
        Ok(BuildInput {
            name: name.to_string(),
            versioned_resource: versioned_resource.clone(),
            first_occurrence: state.first_occurrence(build, version_id),
        })
    }

    async fn save_build_output(
        &self,
        build_id: BuildId,
        versioned_resource: &VersionedResource,
    ) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let pipeline_id = state.build_pipeline(build_id)?;
        let version_id = state.upsert_version(pipeline_id, versioned_resource, false)?;
        if !state.outputs.contains(&(build_id, version_id)) {
            state.outputs.push((build_id, version_id));
        }
        Ok(())
    }

    async fn build_resources(&self, build_id: BuildId) -> DbResult<BuildResources> {
        let state = self.state.lock().await;
        let inputs = state.inputs_of(build_id)?;

        let mut outputs: Vec<BuildOutput> = state
            .outputs
            .iter()
            .filter(|(b, _)| *b == build_id)
            .filter(|(_, v)| {
                !state
                    .inputs
                    .iter()
                    .any(|i| i.build_id == build_id && i.version_id == *v)
            })
            .filter_map(|(_, v)| state.version(*v))
            .map(|record| BuildOutput {
                versioned_resource: record.versioned_resource.clone(),
            })
            .collect();
        outputs.sort_by(|a, b| a.versioned_resource.resource.cmp(&b.versioned_resource.resource));

        Ok(BuildResources { inputs, outputs })
    }

    async fn job_build_for_inputs(
        &self,
        job_id: JobId,
        inputs: &[(String, VersionedResource)],
    ) -> DbResult<Option<Build>> {
        if inputs.is_empty() {
            return Ok(None);
        }

        let state = self.state.lock().await;
        let Some(job) = state.job(job_id) else {
            return Ok(None);
        };

        let mut wanted = Vec::with_capacity(inputs.len());
        for (name, versioned_resource) in inputs {
            match state.find_version(job.job.pipeline_id, versioned_resource) {
                Some(version_id) => wanted.push((name.as_str(), version_id)),
                None => return Ok(None),
            }
        }

        Ok(state
            .builds
            .values()
            .rev()
            .filter(|b| b.job_id == Some(job_id))
            .find(|b| {
                wanted.iter().all(|(name, version_id)| {
                    state.inputs.iter().any(|i| {
                        i.build_id == b.id && i.name == *name && i.version_id == *version_id
                    })
                })
            })
            .cloned())
    }

    async fn version_history(
        &self,
        pipeline_id: PipelineId,
        inputs: &[JobInput],
    ) -> DbResult<VersionHistory> {
        let state = self.state.lock().await;
        let resources: BTreeSet<&str> = inputs.iter().map(|i| i.resource.as_str()).collect();
        let jobs: BTreeSet<&str> = inputs
            .iter()
            .flat_map(|i| i.passed.iter().map(String::as_str))
            .collect();

        let mut history = VersionHistory::default();
        for stored in &state.versions {
            let resource = stored.record.versioned_resource.resource.as_str();
            if stored.pipeline_id == pipeline_id && resources.contains(resource) {
                history
                    .versions
                    .entry(resource.to_string())
                    .or_default()
                    .push(stored.record.clone());
            }
        }
        for versions in history.versions.values_mut() {
            versions.sort_by(|a, b| b.check_order.cmp(&a.check_order));
        }

        for (build_id, version_id) in &state.outputs {
            let Some(build) = state.builds.get(build_id) else {
                continue;
            };
            let Some(job_name) = build.job_name.as_deref() else {
                continue;
            };
            if build.pipeline_id == Some(pipeline_id) && jobs.contains(job_name) {
                history.outputs.push(OutputRecord {
                    build_id: *build_id,
                    job_name: job_name.to_string(),
                    version_id: *version_id,
                });
            }
        }

        Ok(history)
    }
}

#[async_trait]
impl LogRepo for MemoryStore {
    async fn append_log(&self, build_id: BuildId, content: &str) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.build(build_id)?;
        state.logs.entry(build_id).or_default().push_str(content);
        Ok(())
    }

    async fn log(&self, build_id: BuildId) -> DbResult<String> {
        let state = self.state.lock().await;
        Ok(state.logs.get(&build_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_core::{JobConfig, MetadataField, ResourceConfig};
    use std::sync::Arc;

    fn resource(name: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: "git".to_string(),
        }
    }

    fn serial_job(name: &str, groups: &[&str]) -> JobConfig {
        JobConfig {
            serial: true,
            serial_groups: groups.iter().map(|g| g.to_string()).collect(),
            ..JobConfig::new(name)
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            name: "some-pipeline".to_string(),
            resources: vec![resource("some-resource"), resource("some-other-resource")],
            jobs: vec![
                JobConfig {
                    inputs: vec![JobInput::new("some-resource")],
                    ..JobConfig::new("some-job")
                },
                serial_job("serial-job", &[]),
                serial_job("deploy-a", &["prod"]),
                serial_job("deploy-b", &["prod"]),
            ],
        }
    }

    async fn setup() -> (MemoryStore, Team, Pipeline) {
        let store = MemoryStore::new();
        let team = store.create_team("main").await.unwrap();
        let pipeline = store.save_pipeline(team.id, &config()).await.unwrap();
        (store, team, pipeline)
    }

    async fn job(store: &MemoryStore, pipeline: &Pipeline, name: &str) -> Job {
        store.job(pipeline.id, name).await.unwrap().unwrap()
    }

    fn request(job: &Job, build: &Build) -> AdmissionRequest {
        AdmissionRequest {
            build_id: build.id,
            pipeline_id: Some(job.pipeline_id),
            serial_groups: job.effective_serial_groups(),
            abort_url: None,
        }
    }

    fn version(resource: &str, v: &str) -> VersionedResource {
        VersionedResource::new(resource, "git", [("version", v)])
    }

    #[tokio::test]
    async fn test_duplicate_team_is_rejected() {
        let (store, _, _) = setup().await;
        assert!(matches!(
            store.create_team("main").await.unwrap_err(),
            DbError::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_job_build_names_increase() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;

        let first = store.create_job_build(&job).await.unwrap();
        let second = store.create_job_build(&job).await.unwrap();

        assert_eq!(first.name, "1");
        assert_eq!(second.name, "2");
        assert_eq!(first.job_name.as_deref(), Some("some-job"));
        assert_eq!(first.status, BuildStatus::Pending);
        assert!(first.interceptible);
        assert!(!first.scheduled);
    }

    #[tokio::test]
    async fn test_reconfiguring_keeps_sequence() {
        let (store, team, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        store.create_job_build(&job).await.unwrap();

        let mut config = config();
        config.jobs[0].serial_groups = vec!["new-group".to_string()];
        store.save_pipeline(team.id, &config).await.unwrap();

        let reconfigured = store.job_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(reconfigured.serial_groups, vec!["new-group"]);
        assert_eq!(store.create_job_build(&reconfigured).await.unwrap().name, "2");
    }

    #[tokio::test]
    async fn test_one_off_build_is_named_after_id() {
        let (store, team, _) = setup().await;
        let build = store.create_one_off(team.id).await.unwrap();
        assert_eq!(build.name, build.id.to_string());
        assert!(build.is_one_off());
    }

    #[tokio::test]
    async fn test_non_serial_admission_always_succeeds() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();

        for build in [&one, &two] {
            let request = AdmissionRequest {
                serial_groups: vec![],
                ..request(&job, build)
            };
            assert!(store.admit(&request).await.unwrap().is_admitted());
        }
        assert_eq!(store.started_builds().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_serial_admission_waits_for_running_build() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "serial-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();

        assert!(store.admit(&request(&job, &one)).await.unwrap().is_admitted());
        assert_eq!(
            store.admit(&request(&job, &two)).await.unwrap(),
            Admission::Busy { holder: one.id }
        );

        store.finish(one.id, BuildStatus::Succeeded).await.unwrap();
        assert!(store.admit(&request(&job, &two)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_serial_admission_is_fifo() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "serial-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();
        let three = store.create_job_build(&job).await.unwrap();

        assert_eq!(
            store.admit(&request(&job, &two)).await.unwrap(),
            Admission::Queued { ahead: one.id }
        );

        store.abort(one.id).await.unwrap();
        assert_eq!(
            store.admit(&request(&job, &three)).await.unwrap(),
            Admission::Queued { ahead: two.id }
        );
        assert!(store.admit(&request(&job, &two)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_serial_groups_span_jobs() {
        let (store, _, pipeline) = setup().await;
        let a = job(&store, &pipeline, "deploy-a").await;
        let b = job(&store, &pipeline, "deploy-b").await;
        let build_a = store.create_job_build(&a).await.unwrap();
        let build_b = store.create_job_build(&b).await.unwrap();

        assert_eq!(
            store.admit(&request(&b, &build_b)).await.unwrap(),
            Admission::Queued { ahead: build_a.id }
        );
        assert!(store.admit(&request(&a, &build_a)).await.unwrap().is_admitted());
        assert_eq!(
            store.admit(&request(&b, &build_b)).await.unwrap(),
            Admission::Busy {
                holder: build_a.id
            }
        );
    }

    #[tokio::test]
    async fn test_aborted_build_cannot_be_admitted() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "serial-job").await;
        let build = store.create_job_build(&job).await.unwrap();

        store.abort(build.id).await.unwrap();
        assert_eq!(
            store.admit(&request(&job, &build)).await.unwrap(),
            Admission::NotPending(BuildStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn test_concurrent_admission_admits_exactly_one() {
        let (store, _, pipeline) = setup().await;
        let store = Arc::new(store);
        let job = job(&store, &pipeline, "deploy-a").await;
        let build = store.create_job_build(&job).await.unwrap();

        let results = futures::future::join_all((0..8).map(|_| {
            let store = store.clone();
            let request = request(&job, &build);
            tokio::spawn(async move { store.admit(&request).await.unwrap() })
        }))
        .await;

        let outcomes: Vec<Admission> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|a| a.is_admitted()).count(), 1);
        assert!(
            outcomes
                .iter()
                .filter(|a| !a.is_admitted())
                .all(|a| *a == Admission::NotPending(BuildStatus::Started))
        );
        assert_eq!(store.started_builds().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_across_group_starts_oldest_only() {
        let (store, _, pipeline) = setup().await;
        let store = Arc::new(store);
        let a = job(&store, &pipeline, "deploy-a").await;
        let b = job(&store, &pipeline, "deploy-b").await;

        let mut requests = Vec::new();
        for _ in 0..3 {
            let build_a = store.create_job_build(&a).await.unwrap();
            requests.push(request(&a, &build_a));
            let build_b = store.create_job_build(&b).await.unwrap();
            requests.push(request(&b, &build_b));
        }
        let oldest = requests[0].build_id;

        let results = futures::future::join_all(requests.into_iter().rev().map(|request| {
            let store = store.clone();
            tokio::spawn(async move { store.admit(&request).await.unwrap() })
        }))
        .await;

        let admitted = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(Admission::is_admitted)
            .count();
        assert_eq!(admitted, 1);

        let started = store.started_builds().await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, oldest);
        assert_eq!(started[0].job_name.as_deref(), Some("deploy-a"));
    }

    #[tokio::test]
    async fn test_admission_records_abort_url() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let build = store.create_job_build(&job).await.unwrap();

        let request = AdmissionRequest {
            abort_url: Some("http://worker/abort".to_string()),
            ..request(&job, &build)
        };
        store.admit(&request).await.unwrap();

        assert_eq!(
            store.abort(build.id).await.unwrap().as_deref(),
            Some("http://worker/abort")
        );
        let aborted = store.build(build.id).await.unwrap().unwrap();
        assert_eq!(aborted.status, BuildStatus::Aborted);
        assert!(aborted.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_abort_of_finished_build_is_a_no_op() {
        let (store, team, _) = setup().await;
        let build = store.create_one_off(team.id).await.unwrap();
        store.abort(build.id).await.unwrap();
        assert_eq!(store.abort(build.id).await.unwrap(), None);
        assert_eq!(
            store.build(build.id).await.unwrap().unwrap().status,
            BuildStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_repeated_completion_is_rejected() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let build = store.create_job_build(&job).await.unwrap();

        assert!(matches!(
            store.finish(build.id, BuildStatus::Succeeded).await.unwrap_err(),
            DbError::InvalidTransition {
                from: BuildStatus::Pending,
                ..
            }
        ));

        store.admit(&request(&job, &build)).await.unwrap();
        let finished = store.finish(build.id, BuildStatus::Failed).await.unwrap();
        assert_eq!(finished.status, BuildStatus::Failed);
        assert!(finished.ended_at.is_some());

        assert!(matches!(
            store.finish(build.id, BuildStatus::Succeeded).await.unwrap_err(),
            DbError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_resaving_version_overwrites_and_becomes_latest() {
        let (store, _, pipeline) = setup().await;
        store
            .save_versioned_resource(pipeline.id, &version("some-resource", "1"))
            .await
            .unwrap();
        store
            .save_versioned_resource(pipeline.id, &version("some-resource", "2"))
            .await
            .unwrap();

        let mut resaved = version("some-resource", "1");
        resaved.metadata.push(MetadataField::new("a", "b"));
        store
            .save_versioned_resource(pipeline.id, &resaved)
            .await
            .unwrap();

        let latest = store
            .latest_versioned_resource(pipeline.id, "some-resource")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, resaved);
    }

    #[tokio::test]
    async fn test_recording_build_versions_keeps_latest() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        store
            .save_versioned_resource(pipeline.id, &version("some-resource", "1"))
            .await
            .unwrap();
        store
            .save_versioned_resource(pipeline.id, &version("some-resource", "2"))
            .await
            .unwrap();

        let build = store.create_job_build(&job).await.unwrap();
        store
            .save_build_input(build.id, "some-input", &version("some-resource", "1"))
            .await
            .unwrap();
        store
            .save_build_output(build.id, &version("some-resource", "1"))
            .await
            .unwrap();
        let inputs = [("some-input".to_string(), version("some-resource", "1"))];
        store
            .create_job_build_with_inputs(&job, &inputs)
            .await
            .unwrap();

        let latest = store
            .latest_versioned_resource(pipeline.id, "some-resource")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, version("some-resource", "2"));

        // A version first seen as an output is new, so it becomes the latest.
        store
            .save_build_output(build.id, &version("some-resource", "3"))
            .await
            .unwrap();
        let latest = store
            .latest_versioned_resource(pipeline.id, "some-resource")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest, version("some-resource", "3"));
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let (store, _, pipeline) = setup().await;
        assert!(matches!(
            store
                .save_versioned_resource(pipeline.id, &version("nope", "1"))
                .await
                .unwrap_err(),
            DbError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_build_resources_hide_implicit_outputs() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let build = store.create_job_build(&job).await.unwrap();

        let input = version("some-resource", "1");
        let output = version("some-other-resource", "1");
        store
            .save_build_input(build.id, "some-input", &input)
            .await
            .unwrap();
        store.save_build_output(build.id, &input).await.unwrap();
        store.save_build_output(build.id, &output).await.unwrap();

        let resources = store.build_resources(build.id).await.unwrap();
        assert_eq!(
            resources.inputs,
            vec![BuildInput {
                name: "some-input".to_string(),
                versioned_resource: input,
                first_occurrence: true,
            }]
        );
        assert_eq!(
            resources.outputs,
            vec![BuildOutput {
                versioned_resource: output
            }]
        );
    }

    #[tokio::test]
    async fn test_first_occurrence_is_scoped_to_job() {
        let (store, _, pipeline) = setup().await;
        let some_job = job(&store, &pipeline, "some-job").await;
        let other_job = job(&store, &pipeline, "serial-job").await;
        let vr = version("some-resource", "1");

        let one = store.create_job_build(&some_job).await.unwrap();
        let first = store.save_build_input(one.id, "input", &vr).await.unwrap();
        assert!(first.first_occurrence);

        // Saving again for the same build does not change the answer.
        let again = store.save_build_input(one.id, "input", &vr).await.unwrap();
        assert!(again.first_occurrence);

        let two = store.create_job_build(&some_job).await.unwrap();
        let second = store.save_build_input(two.id, "input", &vr).await.unwrap();
        assert!(!second.first_occurrence);

        let other = store.create_job_build(&other_job).await.unwrap();
        let elsewhere = store.save_build_input(other.id, "input", &vr).await.unwrap();
        assert!(elsewhere.first_occurrence);
    }

    #[tokio::test]
    async fn test_one_off_builds_cannot_record_versions() {
        let (store, team, _) = setup().await;
        let build = store.create_one_off(team.id).await.unwrap();
        assert!(matches!(
            store
                .save_build_output(build.id, &version("some-resource", "1"))
                .await
                .unwrap_err(),
            DbError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_job_build_for_inputs() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let inputs = vec![
            ("some-input".to_string(), version("some-resource", "1")),
            ("other-input".to_string(), version("some-other-resource", "1")),
        ];

        assert_eq!(store.job_build_for_inputs(job.id, &inputs).await.unwrap(), None);

        let build = store
            .create_job_build_with_inputs(&job, &inputs)
            .await
            .unwrap();
        let found = store.job_build_for_inputs(job.id, &inputs).await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(build.id));

        let different = vec![("some-input".to_string(), version("some-resource", "2"))];
        store
            .save_versioned_resource(pipeline.id, &different[0].1)
            .await
            .unwrap();
        assert_eq!(
            store.job_build_for_inputs(job.id, &different).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_next_pending_build_carries_inputs() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let inputs = vec![("some-input".to_string(), version("some-resource", "1"))];

        let build = store
            .create_job_build_with_inputs(&job, &inputs)
            .await
            .unwrap();
        store.create_job_build(&job).await.unwrap();

        let (next, next_inputs) = store.next_pending_build(job.id).await.unwrap().unwrap();
        assert_eq!(next.id, build.id);
        assert_eq!(next_inputs.len(), 1);
        assert_eq!(next_inputs[0].name, "some-input");
        assert!(next_inputs[0].first_occurrence);
    }

    #[tokio::test]
    async fn test_current_build_prefers_started() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        assert_eq!(store.current_build(job.id).await.unwrap(), None);

        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();
        assert_eq!(store.current_build(job.id).await.unwrap().unwrap().id, one.id);

        let unbounded = AdmissionRequest {
            serial_groups: vec![],
            ..request(&job, &two)
        };
        store.admit(&unbounded).await.unwrap();
        assert_eq!(store.current_build(job.id).await.unwrap().unwrap().id, two.id);

        store.abort(one.id).await.unwrap();
        store.abort(two.id).await.unwrap();
        assert_eq!(store.current_build(job.id).await.unwrap().unwrap().id, two.id);
    }

    #[tokio::test]
    async fn test_drainable_builds() {
        let (store, team, _) = setup().await;
        let pending = store.create_one_off(team.id).await.unwrap();
        let done = store.create_one_off(team.id).await.unwrap();
        store.abort(done.id).await.unwrap();

        let drainable = store.drainable_builds().await.unwrap();
        assert_eq!(drainable.iter().map(|b| b.id).collect::<Vec<_>>(), vec![done.id]);

        store.set_drained(done.id, true).await.unwrap();
        assert!(store.drainable_builds().await.unwrap().is_empty());
        assert!(
            !store
                .build(pending.id)
                .await
                .unwrap()
                .unwrap()
                .drained
        );
    }

    #[tokio::test]
    async fn test_logs_append() {
        let (store, team, _) = setup().await;
        let build = store.create_one_off(team.id).await.unwrap();
        assert_eq!(store.log(build.id).await.unwrap(), "");

        store.append_log(build.id, "some ").await.unwrap();
        store.append_log(build.id, "log").await.unwrap();
        assert_eq!(store.log(build.id).await.unwrap(), "some log");
    }

    #[tokio::test]
    async fn test_retention_queries() {
        let (store, _, pipeline) = setup().await;
        let job = job(&store, &pipeline, "some-job").await;
        let one = store.create_job_build(&job).await.unwrap();
        let two = store.create_job_build(&job).await.unwrap();
        store.create_job_build(&job).await.unwrap();
        store.abort(one.id).await.unwrap();
        store.abort(two.id).await.unwrap();

        assert_eq!(store.latest_completed_build_ids().await.unwrap(), vec![two.id]);
        assert_eq!(store.interceptible_completed_builds().await.unwrap().len(), 2);

        assert!(store.mark_non_interceptible(one.id).await.unwrap());
        assert!(!store.mark_non_interceptible(one.id).await.unwrap());
        assert_eq!(store.interceptible_completed_builds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_visibility_scopes() {
        let (store, team, pipeline) = setup().await;
        let other_team = store.create_team("other").await.unwrap();
        let other_pipeline = store
            .save_pipeline(other_team.id, &config())
            .await
            .unwrap();

        let own = store.create_one_off(team.id).await.unwrap();
        let foreign = store.create_one_off(other_team.id).await.unwrap();
        let other_job = job(&store, &other_pipeline, "some-job").await;
        let exposed = store.create_job_build(&other_job).await.unwrap();
        let hidden_job = job(&store, &pipeline, "some-job").await;
        let hidden = store.create_job_build(&hidden_job).await.unwrap();

        store.set_public(other_pipeline.id, true).await.unwrap();

        let ids = |builds: Vec<Build>| builds.into_iter().map(|b| b.id).collect::<Vec<_>>();
        let page = Page::default();

        let (visible, _) = store
            .visible_builds(&["main".to_string()], &page)
            .await
            .unwrap();
        assert_eq!(ids(visible), vec![hidden.id, exposed.id, own.id]);

        let (all, _) = store.all_builds(&page).await.unwrap();
        assert_eq!(ids(all), vec![hidden.id, exposed.id, foreign.id, own.id]);

        let (public, _) = store.public_builds(&page).await.unwrap();
        assert_eq!(ids(public), vec![exposed.id]);
    }

    #[tokio::test]
    async fn test_pagination_cursors() {
        let (store, team, _) = setup().await;
        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(store.create_one_off(team.id).await.unwrap().id);
        }

        let (first, pagination) = store.all_builds(&Page::with_limit(2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, created[4]);
        assert_eq!(pagination.previous, None);

        let (second, pagination) = store.all_builds(&pagination.next.unwrap()).await.unwrap();
        assert_eq!(second[0].id, created[2]);
        assert!(pagination.previous.is_some());
    }

    #[tokio::test]
    async fn test_pagination_by_date_out_of_range() {
        let (store, team, _) = setup().await;
        store.create_one_off(team.id).await.unwrap();

        let future = Page {
            from: Some(Utc::now().timestamp() + 3600),
            use_date: true,
            ..Page::default()
        };
        let (builds, pagination) = store.all_builds(&future).await.unwrap();
        assert!(builds.is_empty());
        assert_eq!(pagination, Pagination::default());

        let ancient = Page {
            to: Some(1),
            use_date: true,
            ..Page::default()
        };
        let (builds, _) = store.all_builds(&ancient).await.unwrap();
        assert!(builds.is_empty());
    }

    #[tokio::test]
    async fn test_version_history_snapshot() {
        let (store, _, pipeline) = setup().await;
        let upstream = job(&store, &pipeline, "some-job").await;
        let build = store.create_job_build(&upstream).await.unwrap();

        store
            .save_versioned_resource(pipeline.id, &version("some-resource", "1"))
            .await
            .unwrap();
        store
            .save_build_output(build.id, &version("some-resource", "2"))
            .await
            .unwrap();

        let inputs = vec![JobInput::new("some-resource").passed(["some-job"])];
        let history = store.version_history(pipeline.id, &inputs).await.unwrap();

        let versions = &history.versions["some-resource"];
        assert_eq!(versions.len(), 2);
        assert_eq!(
            history.latest("some-resource").unwrap().versioned_resource,
            version("some-resource", "2")
        );
        assert_eq!(history.outputs.len(), 1);
        assert_eq!(history.outputs[0].build_id, build.id);
        assert_eq!(history.outputs[0].job_name, "some-job");
    }
}
