//! Worker collaborator traits.
//!
//! Workers run build steps in containers and hold the volumes those steps
//! produce. Lockstep never manages them itself; it only looks them up by
//! team and handle through a [`WorkerProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{BuildId, Error, Result, TeamId};

/// What to create when no container exists for a handle yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container image to run.
    pub image: String,
    /// Command to execute.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Build the container belongs to, if any.
    pub build_id: Option<BuildId>,
}

/// A container living on some worker.
pub trait Container: Send + Sync + std::fmt::Debug {
    fn handle(&self) -> &str;
}

/// A volume living on some worker.
pub trait Volume: Send + Sync + std::fmt::Debug {
    fn handle(&self) -> &str;
}

/// A single worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name of this worker.
    fn name(&self) -> &str;

    async fn find_container_by_handle(
        &self,
        team_id: TeamId,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>>;

    async fn find_volume_by_handle(
        &self,
        team_id: TeamId,
        handle: &str,
    ) -> Result<Option<Arc<dyn Volume>>>;

    async fn create_container(
        &self,
        team_id: TeamId,
        handle: &str,
        spec: &ContainerSpec,
    ) -> Result<Arc<dyn Container>>;
}

/// Locates workers.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    async fn find_worker_for_container(
        &self,
        team_id: TeamId,
        handle: &str,
    ) -> Result<Option<Arc<dyn Worker>>>;

    async fn find_worker_for_volume(
        &self,
        team_id: TeamId,
        handle: &str,
    ) -> Result<Option<Arc<dyn Worker>>>;

    /// Workers currently able to accept containers for a team.
    async fn running_workers(&self, team_id: TeamId) -> Result<Vec<Arc<dyn Worker>>>;
}

/// Looks up containers and volumes across the worker pool.
pub struct WorkerClient {
    provider: Arc<dyn WorkerProvider>,
}

impl WorkerClient {
    pub fn new(provider: Arc<dyn WorkerProvider>) -> Self {
        Self { provider }
    }

    pub async fn find_container(
        &self,
        team_id: TeamId,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>> {
        match self.provider.find_worker_for_container(team_id, handle).await? {
            Some(worker) => worker.find_container_by_handle(team_id, handle).await,
            None => Ok(None),
        }
    }

    pub async fn find_volume(
        &self,
        team_id: TeamId,
        handle: &str,
    ) -> Result<Option<Arc<dyn Volume>>> {
        match self.provider.find_worker_for_volume(team_id, handle).await? {
            Some(worker) => worker.find_volume_by_handle(team_id, handle).await,
            None => Ok(None),
        }
    }

    /// Return the existing container for a handle, or create it on the
    /// first running worker.
    pub async fn find_or_create_container(
        &self,
        team_id: TeamId,
        handle: &str,
        spec: &ContainerSpec,
    ) -> Result<Arc<dyn Container>> {
        if let Some(container) = self.find_container(team_id, handle).await? {
            return Ok(container);
        }

        let workers = self.provider.running_workers(team_id).await?;
        let worker = workers
            .first()
            .ok_or_else(|| Error::Unavailable(format!("no workers for team {team_id}")))?;
        worker.create_container(team_id, handle, spec).await
    }
}
