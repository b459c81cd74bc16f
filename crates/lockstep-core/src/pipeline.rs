//! Teams, pipelines and pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::{JobInput, PipelineId, TeamId};

/// An owning scope for pipelines and one-off builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
}

/// A pipeline owned by a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub team_id: TeamId,
    pub name: String,
    /// Exposed pipelines are visible to everyone.
    pub public: bool,
}

/// Declarative pipeline definition, as applied from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub resources: Vec<ResourceConfig>,
    pub jobs: Vec<JobConfig>,
}

impl PipelineConfig {
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// A resource declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub resource_type: String,
}

/// A job declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub serial: bool,
    pub serial_groups: Vec<String>,
    pub inputs: Vec<JobInput>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
