//! Jobs, serial groups and declared inputs.

use serde::{Deserialize, Serialize};

use crate::{JobId, PipelineId};

/// An input a job declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    /// Name the version is exposed under inside the build.
    pub name: String,
    /// Resource to take versions from.
    pub resource: String,
    /// Upstream jobs the version must have been an output of.
    #[serde(default)]
    pub passed: Vec<String>,
}

impl JobInput {
    pub fn new(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            name: resource.clone(),
            resource,
            passed: Vec::new(),
        }
    }

    pub fn passed<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.passed = jobs.into_iter().map(Into::into).collect();
        self
    }
}

/// A job registered by applying a pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub serial: bool,
    pub serial_groups: Vec<String>,
    pub inputs: Vec<JobInput>,
}

impl Job {
    /// Declaring serial groups implies serial execution.
    pub fn is_serial(&self) -> bool {
        self.serial || !self.serial_groups.is_empty()
    }

    /// Groups this job takes part in. A job without explicit groups is
    /// its own implicit group.
    pub fn effective_serial_groups(&self) -> Vec<String> {
        if self.serial_groups.is_empty() {
            vec![self.name.clone()]
        } else {
            self.serial_groups.clone()
        }
    }

    pub fn shares_group_with(&self, groups: &[String]) -> bool {
        self.effective_serial_groups()
            .iter()
            .any(|g| groups.contains(g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, serial: bool, groups: &[&str]) -> Job {
        Job {
            id: JobId::new(1),
            pipeline_id: PipelineId::new(1),
            name: name.to_string(),
            serial,
            serial_groups: groups.iter().map(|g| g.to_string()).collect(),
            inputs: vec![],
        }
    }

    #[test]
    fn test_serial_job_without_groups_is_its_own_group() {
        let j = job("deploy", true, &[]);
        assert!(j.is_serial());
        assert_eq!(j.effective_serial_groups(), vec!["deploy".to_string()]);
    }

    #[test]
    fn test_groups_imply_serial() {
        let j = job("deploy", false, &["prod"]);
        assert!(j.is_serial());
        assert!(j.shares_group_with(&["prod".to_string()]));
        assert!(!j.shares_group_with(&["deploy".to_string()]));
    }

    #[test]
    fn test_input_builder() {
        let input = JobInput::new("repo").passed(["unit", "integration"]);
        assert_eq!(input.name, "repo");
        assert_eq!(input.passed, vec!["unit", "integration"]);
    }
}
