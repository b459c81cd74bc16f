//! Scheduling core for Lockstep.
//!
//! - Version resolution for job inputs with passed constraints
//! - Serial-group admission of pending builds
//! - The retention sweep over finished builds
//! - A per-job tick tying the three together

pub mod error;
pub mod resolver;
pub mod retention;
pub mod serial;
pub mod tick;

pub use error::{ResolveError, SchedulerError, SchedulerResult};
pub use resolver::{ResolvedInput, VersionResolver, resolve_history};
pub use retention::{RetentionPolicy, RetentionSweeper, SweepReport};
pub use serial::SerialScheduler;
pub use tick::{JobScheduler, TickReport};
