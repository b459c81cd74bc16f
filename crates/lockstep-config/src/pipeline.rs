//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "deploy-train"
//!
//! resource "repo" type="git"
//!
//! job "unit" {
//!     get "repo"
//! }
//!
//! job "deploy" serial=#true {
//!     serial-groups "prod"
//!     get "repo" {
//!         passed "unit"
//!     }
//! }
//! ```

use crate::kdl_util::{
    get_bool_prop, get_first_string_arg, get_string_list_prop, get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use lockstep_core::{JobConfig, JobInput, PipelineConfig, ResourceConfig};
use std::collections::{HashMap, HashSet};

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut resources = Vec::new();
    let mut jobs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "resource" => {
                resources.push(parse_resource(node)?);
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let config = PipelineConfig {
        name,
        resources,
        jobs,
    };
    validate(&config)?;

    Ok(config)
}

fn parse_resource(node: &KdlNode) -> ConfigResult<ResourceConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource name".to_string()))?;
    let resource_type = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for resource '{}'", name)))?;

    Ok(ResourceConfig {
        name,
        resource_type,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let serial = get_bool_prop(node, "serial").unwrap_or(false);
    let serial_groups = get_string_list_prop(node, "serial-groups");
    let mut inputs = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "get" {
                inputs.push(parse_input(child)?);
            }
        }
    }

    Ok(JobConfig {
        name,
        serial,
        serial_groups,
        inputs,
    })
}

fn parse_input(node: &KdlNode) -> ConfigResult<JobInput> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("get name".to_string()))?;
    let resource = get_string_prop(node, "resource").unwrap_or_else(|| name.clone());
    let passed = get_string_list_prop(node, "passed");

    Ok(JobInput {
        name,
        resource,
        passed,
    })
}

fn validate(config: &PipelineConfig) -> ConfigResult<()> {
    let mut resource_names = HashSet::new();
    for resource in &config.resources {
        if !resource_names.insert(resource.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("resource '{}'", resource.name)));
        }
    }

    let mut job_names = HashSet::new();
    for job in &config.jobs {
        if !job_names.insert(job.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
    }

    for job in &config.jobs {
        let mut input_names = HashSet::new();
        for input in &job.inputs {
            if !input_names.insert(input.name.as_str()) {
                return Err(ConfigError::Duplicate(format!(
                    "input '{}' of job '{}'",
                    input.name, job.name
                )));
            }

            if !resource_names.contains(input.resource.as_str()) {
                return Err(ConfigError::UnknownResource {
                    job: job.name.clone(),
                    resource: input.resource.clone(),
                });
            }

            for upstream in &input.passed {
                if !job_names.contains(upstream.as_str()) {
                    return Err(ConfigError::UnknownPassedJob {
                        job: job.name.clone(),
                        input: input.name.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }
    }

    if let Err(cycle) = detect_cycle(&config.jobs) {
        return Err(ConfigError::PassedCycle(cycle));
    }

    Ok(())
}

fn upstream_jobs(job: &JobConfig) -> impl Iterator<Item = &str> {
    job.inputs
        .iter()
        .flat_map(|i| i.passed.iter().map(String::as_str))
}

/// Detect cycles in the passed-constraint graph using DFS.
fn detect_cycle(jobs: &[JobConfig]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &JobConfig> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(&job.name, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &HashMap<&'a str, &'a JobConfig>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(&job) = job_map.get(node) {
        for dep in upstream_jobs(job) {
            if !visited.contains_key(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
