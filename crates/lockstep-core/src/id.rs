//! Resource identifiers.
//!
//! Every persisted entity is keyed by a store-assigned integer. Integer keys
//! preserve creation order, which keyset pagination and FIFO admission rely on.

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! store_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(i64);

        impl $name {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Get the underlying integer key.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

store_id!(
    /// Identifier of a team (an owning scope).
    TeamId
);
store_id!(
    /// Identifier of a pipeline.
    PipelineId
);
store_id!(
    /// Identifier of a job within a pipeline.
    JobId
);
store_id!(
    /// Identifier of a declared resource.
    ResourceId
);
store_id!(
    /// Identifier of a saved (resource, version) pair.
    VersionId
);
store_id!(
    /// Identifier of a build. Assigned in creation order.
    BuildId
);
