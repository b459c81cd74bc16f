//! Resource version resolution.
//!
//! Picks, for each declared input of a job, the newest version that satisfies
//! its passed constraints. Inputs that share an upstream job must take their
//! versions from a single build of that job, which keeps dependent jobs
//! moving in lock-step instead of mixing unrelated upstream snapshots.

use lockstep_core::{
    BuildId, JobInput, PipelineId, VersionHistory, VersionId, VersionRecord, VersionedResource,
};
use lockstep_db::VersionRepo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::ResolveError;

/// A version chosen for one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub name: String,
    pub versioned_resource: VersionedResource,
}

/// Resolves job inputs against the stored version history.
pub struct VersionResolver {
    versions: Arc<dyn VersionRepo>,
}

impl VersionResolver {
    pub fn new(versions: Arc<dyn VersionRepo>) -> Self {
        Self { versions }
    }

    pub async fn resolve(
        &self,
        pipeline_id: PipelineId,
        inputs: &[JobInput],
    ) -> Result<Vec<ResolvedInput>, ResolveError> {
        let history = self.versions.version_history(pipeline_id, inputs).await?;
        let resolved = resolve_history(&history, inputs);
        if resolved.is_err() {
            debug!(pipeline_id = %pipeline_id, inputs = inputs.len(), "No consistent version set");
        }
        resolved
    }
}

/// A candidate version and, per passed job, the builds that produced it.
struct Candidate<'a> {
    record: &'a VersionRecord,
    producers: HashMap<&'a str, BTreeSet<BuildId>>,
}

/// Builds of each shared job that every choice so far agrees on.
type Constraints<'a> = HashMap<&'a str, BTreeSet<BuildId>>;

/// Resolve inputs against a history snapshot.
pub fn resolve_history(
    history: &VersionHistory,
    inputs: &[JobInput],
) -> Result<Vec<ResolvedInput>, ResolveError> {
    let mut producers: HashMap<(VersionId, &str), BTreeSet<BuildId>> = HashMap::new();
    for output in &history.outputs {
        producers
            .entry((output.version_id, output.job_name.as_str()))
            .or_default()
            .insert(output.build_id);
    }

    let mut candidates = Vec::with_capacity(inputs.len());
    for input in inputs {
        let list = candidates_for(history, &producers, input);
        if list.is_empty() {
            return Err(ResolveError::Unresolved);
        }
        candidates.push(list);
    }

    let chosen = search(&candidates, 0, Constraints::new())
        .ok_or(ResolveError::Unresolved)?;

    Ok(inputs
        .iter()
        .zip(chosen)
        .map(|(input, record)| ResolvedInput {
            name: input.name.clone(),
            versioned_resource: record.versioned_resource.clone(),
        })
        .collect())
}

fn candidates_for<'a>(
    history: &'a VersionHistory,
    producers: &HashMap<(VersionId, &'a str), BTreeSet<BuildId>>,
    input: &'a JobInput,
) -> Vec<Candidate<'a>> {
    if input.passed.is_empty() {
        return history
            .latest(&input.resource)
            .map(|record| Candidate {
                record,
                producers: HashMap::new(),
            })
            .into_iter()
            .collect();
    }

    let Some(versions) = history.versions.get(&input.resource) else {
        return Vec::new();
    };

    versions
        .iter()
        .filter_map(|record| {
            let mut by_job = HashMap::new();
            for job in &input.passed {
                let builds = producers.get(&(record.id, job.as_str()))?;
                by_job.insert(job.as_str(), builds.clone());
            }
            Some(Candidate {
                record,
                producers: by_job,
            })
        })
        .collect()
}

/// Depth-first search in declaration order, newest candidate first.
fn search<'a>(
    candidates: &[Vec<Candidate<'a>>],
    index: usize,
    constraints: Constraints<'a>,
) -> Option<Vec<&'a VersionRecord>> {
    let Some(options) = candidates.get(index) else {
        return Some(Vec::new());
    };

    'candidates: for candidate in options {
        let mut narrowed = constraints.clone();
        for (job, builds) in &candidate.producers {
            let allowed: BTreeSet<BuildId> = match narrowed.get(job) {
                Some(existing) => existing.intersection(builds).copied().collect(),
                None => builds.clone(),
            };
            if allowed.is_empty() {
                continue 'candidates;
            }
            narrowed.insert(*job, allowed);
        }

        if let Some(mut rest) = search(candidates, index + 1, narrowed) {
            rest.insert(0, candidate.record);
            return Some(rest);
        }
    }

    None
}
