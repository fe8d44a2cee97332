//! Core types for the target-environment boundary.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a concrete resource on the target environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    /// Create a new resource identity.
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// One rendered resource descriptor.
///
/// `payload` carries the full document; the named fields are extracted for
/// identity and routing. A manifest without an explicit namespace is applied
/// into its owning configuration object's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub payload: serde_json::Value,
}

impl Manifest {
    /// Resolve this manifest's identity, defaulting the namespace.
    pub fn resource_id(&self, default_namespace: &str) -> ResourceId {
        ResourceId {
            kind: self.kind.clone(),
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            name: self.name.clone(),
        }
    }
}

/// Version token for optimistic-concurrency updates.
///
/// Tokens are opaque to callers; only the issuing store compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Create a version token from a raw counter value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw counter value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resource as currently stored on the target environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: ResourceId,
    pub manifest: Manifest,
    pub version: Version,
}

/// Content revision identifier of a resolved source (commit hash or
/// equivalent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(String);

impl Revision {
    /// Create a revision from its identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pinned location in a source repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GitSource {
    /// Repository URI.
    pub uri: String,
    /// Branch, tag, or commit.
    pub reference: String,
    /// Sub-path within the repository.
    pub context_dir: String,
}

impl GitSource {
    /// Create a new pinned source.
    pub fn new(
        uri: impl Into<String>,
        reference: impl Into<String>,
        context_dir: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            reference: reference.into(),
            context_dir: context_dir.into(),
        }
    }
}

impl fmt::Display for GitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.uri, self.reference, self.context_dir)
    }
}

/// Directory-tree snapshot fetched at a pinned reference.
///
/// Paths are relative to the source's context dir. The map keeps files in
/// path order, which is what makes render output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTree {
    pub files: BTreeMap<String, String>,
}

impl SourceTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the tree.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Number of files in the tree.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check whether the tree has no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
