//! Versioned resources and the history snapshot used for input resolution.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{BuildId, VersionId};

/// Resource source configuration, stored as a JSON object.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// Opaque key/value fingerprint of a resource version.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(BTreeMap<String, String>);

impl Version {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Version {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Version {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// A single metadata entry reported alongside a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A (resource, version) pair with its mutable source and metadata.
///
/// Identity is the resource name plus the version; saving the same pair
/// again overwrites `source` and `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResource {
    pub resource: String,
    pub resource_type: String,
    pub version: Version,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

impl VersionedResource {
    pub fn new(
        resource: impl Into<String>,
        resource_type: impl Into<String>,
        version: impl Into<Version>,
    ) -> Self {
        Self {
            resource: resource.into(),
            resource_type: resource_type.into(),
            version: version.into(),
            source: Source::new(),
            metadata: Vec::new(),
        }
    }

    pub fn same_identity(&self, other: &VersionedResource) -> bool {
        self.resource == other.resource && self.version == other.version
    }
}

/// A saved version together with its store identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: VersionId,
    /// Monotonic save counter; higher is newer.
    pub check_order: i64,
    pub versioned_resource: VersionedResource,
}

/// A version a build of a job produced (explicitly or implicitly).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRecord {
    pub build_id: BuildId,
    pub job_name: String,
    pub version_id: VersionId,
}

/// Consistent snapshot of version history within one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Saved versions per resource name, newest first.
    pub versions: HashMap<String, Vec<VersionRecord>>,
    /// Build outputs of the jobs named in the resolved inputs' passed lists.
    pub outputs: Vec<OutputRecord>,
}

impl VersionHistory {
    pub fn latest(&self, resource: &str) -> Option<&VersionRecord> {
        self.versions.get(resource).and_then(|v| v.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_ignores_source_and_metadata() {
        let a = VersionedResource::new("repo", "git", [("ref", "abc")]);
        let mut b = a.clone();
        b.metadata.push(MetadataField::new("author", "someone"));
        b.source
            .insert("uri".to_string(), serde_json::json!("https://example.com"));

        assert!(a.same_identity(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_serializes_as_plain_object() {
        let version = Version::from([("ref", "abc")]);
        let json = serde_json::to_value(&version).unwrap();
        assert_eq!(json, serde_json::json!({"ref": "abc"}));
    }
}
