//! Core domain types and traits for the Lockstep CI scheduling core.
//!
//! This crate contains:
//! - Typed identifiers
//! - Builds and the build status state machine
//! - The serial-group admission rule
//! - Jobs, serial groups and declared inputs
//! - Versioned resources and the history snapshot used for resolution
//! - Keyset pagination and visibility scopes
//! - Worker collaborator traits (containers and volumes)

pub mod admission;
pub mod build;
pub mod error;
pub mod id;
pub mod job;
pub mod page;
pub mod pipeline;
pub mod resource;
pub mod worker;

pub use admission::{Admission, AdmissionRequest};
pub use build::{Build, BuildInput, BuildOutput, BuildStatus};
pub use error::{Error, Result};
pub use id::{BuildId, JobId, PipelineId, ResourceId, TeamId, VersionId};
pub use job::{Job, JobInput};
pub use page::{Page, Pagination, VisibilityScope};
pub use pipeline::{JobConfig, Pipeline, PipelineConfig, ResourceConfig, Team};
pub use resource::{
    MetadataField, OutputRecord, Source, Version, VersionHistory, VersionRecord, VersionedResource,
};
