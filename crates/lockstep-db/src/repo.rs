//! Repository traits and PostgreSQL implementations.

pub mod build;
pub mod logs;
pub mod pipeline;
pub mod team;
pub mod version;

pub use build::{BuildRepo, PgBuildRepo};
pub use logs::{LogRepo, PgLogRepo};
pub use pipeline::{PgPipelineRepo, PipelineRepo};
pub use team::{PgTeamRepo, TeamRepo};
pub use version::{BuildResources, PgVersionRepo, VersionRepo};
