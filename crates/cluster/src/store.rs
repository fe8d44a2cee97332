//! Resource store trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tend_core::{Error, Result};

use crate::types::{Manifest, ResourceId, StoredResource, Version};

/// Trait for typed resource storage on the target environment.
///
/// Mutations are idempotent at the call-pattern level: re-running the same
/// create/replace/delete sequence after a partial failure converges to the
/// same state. `replace` is a full replace guarded by a version token;
/// a stale token fails with [`Error::Conflict`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a resource by identity.
    async fn get(&self, id: &ResourceId) -> Result<Option<StoredResource>>;

    /// List resources in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<StoredResource>>;

    /// Create a resource; fails with [`Error::AlreadyExists`] if present.
    async fn create(&self, manifest: Manifest, default_namespace: &str) -> Result<StoredResource>;

    /// Replace a resource wholesale, guarded by its version token.
    async fn replace(
        &self,
        manifest: Manifest,
        default_namespace: &str,
        expected: Version,
    ) -> Result<StoredResource>;

    /// Delete a resource. Deleting an absent resource is a no-op.
    async fn delete(&self, id: &ResourceId) -> Result<()>;
}

/// In-memory target environment for tests and embedders without a live
/// platform.
///
/// Supports two fault-injection knobs: [`deny_kind`](Self::deny_kind)
/// simulates admission rejection, [`restrict_kinds`](Self::restrict_kinds)
/// makes every other kind unresolvable.
#[derive(Default)]
pub struct InMemoryCluster {
    resources: RwLock<HashMap<ResourceId, StoredResource>>,
    next_version: AtomicU64,
    denied_kinds: RwLock<HashSet<String>>,
    known_kinds: RwLock<Option<HashSet<String>>>,
}

impl InMemoryCluster {
    /// Create a new empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty cluster wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Reject admission for every resource of the given kind.
    pub async fn deny_kind(&self, kind: impl Into<String>) {
        self.denied_kinds.write().await.insert(kind.into());
    }

    /// Restrict the set of resolvable kinds; operations on any other kind
    /// fail with [`Error::UnknownKind`].
    pub async fn restrict_kinds<I, S>(&self, kinds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = kinds.into_iter().map(Into::into).collect();
        *self.known_kinds.write().await = Some(set);
    }

    /// Total number of stored resources.
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    /// Check whether the cluster holds no resources.
    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    fn mint_version(&self) -> Version {
        Version::new(self.next_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn check_kind(&self, id: &ResourceId) -> Result<()> {
        if let Some(known) = self.known_kinds.read().await.as_ref() {
            if !known.contains(&id.kind) {
                return Err(Error::unknown_kind(&id.kind));
            }
        }
        if self.denied_kinds.read().await.contains(&id.kind) {
            return Err(Error::apply(
                id.to_string(),
                format!("admission denied for kind '{}'", id.kind),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for InMemoryCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<StoredResource>> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<StoredResource>> {
        let resources = self.resources.read().await;
        Ok(resources
            .values()
            .filter(|r| r.id.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, manifest: Manifest, default_namespace: &str) -> Result<StoredResource> {
        let id = manifest.resource_id(default_namespace);
        self.check_kind(&id).await?;

        let mut resources = self.resources.write().await;
        if resources.contains_key(&id) {
            return Err(Error::already_exists(id.to_string()));
        }
        let stored = StoredResource {
            id: id.clone(),
            manifest,
            version: self.mint_version(),
        };
        debug!(resource = %id, version = %stored.version, "resource created");
        resources.insert(id, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        manifest: Manifest,
        default_namespace: &str,
        expected: Version,
    ) -> Result<StoredResource> {
        let id = manifest.resource_id(default_namespace);
        self.check_kind(&id).await?;

        let mut resources = self.resources.write().await;
        let current = resources
            .get(&id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        if current.version != expected {
            return Err(Error::conflict(
                id.to_string(),
                format!(
                    "version token mismatch (expected {expected}, stored {})",
                    current.version
                ),
            ));
        }
        let stored = StoredResource {
            id: id.clone(),
            manifest,
            version: self.mint_version(),
        };
        debug!(resource = %id, version = %stored.version, "resource replaced");
        resources.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        if let Some(known) = self.known_kinds.read().await.as_ref() {
            if !known.contains(&id.kind) {
                return Err(Error::unknown_kind(&id.kind));
            }
        }
        let removed = self.resources.write().await.remove(id);
        if removed.is_some() {
            debug!(resource = %id, "resource deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;

    fn manifest(kind: &str, name: &str, tag: &str) -> Manifest {
        Manifest {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            namespace: None,
            name: name.to_string(),
            payload: serde_json::json!({ "image": format!("app:{tag}") }),
        }
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let cluster = InMemoryCluster::new();
        let stored = cluster
            .create(manifest("Deployment", "web", "1.0"), "ns")
            .await
            .unwrap();

        let fetched = cluster.get(&stored.id).await.unwrap();
        assert_eq!(fetched, Some(stored));
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let cluster = InMemoryCluster::new();
        cluster
            .create(manifest("Deployment", "web", "1.0"), "ns")
            .await
            .unwrap();

        let second = cluster
            .create(manifest("Deployment", "web", "1.0"), "ns")
            .await;
        assert!(matches!(second, Err(Error::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_replace_requires_current_version() {
        let cluster = InMemoryCluster::new();
        let stored = cluster
            .create(manifest("Deployment", "web", "1.0"), "ns")
            .await
            .unwrap();

        let stale = cluster
            .replace(manifest("Deployment", "web", "2.0"), "ns", Version::new(999))
            .await;
        assert!(matches!(stale, Err(Error::Conflict { .. })));

        let replaced = cluster
            .replace(manifest("Deployment", "web", "2.0"), "ns", stored.version)
            .await
            .unwrap();
        assert_ne!(replaced.version, stored.version);
        assert_eq!(replaced.manifest.payload["image"], "app:2.0");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cluster = InMemoryCluster::new();
        let stored = cluster
            .create(manifest("Deployment", "web", "1.0"), "ns")
            .await
            .unwrap();

        cluster.delete(&stored.id).await.unwrap();
        cluster.delete(&stored.id).await.unwrap();
        assert!(cluster.get(&stored.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_denied_kind_fails_admission() {
        let cluster = InMemoryCluster::new();
        cluster.deny_kind("Secret").await;

        let result = cluster.create(manifest("Secret", "token", "1.0"), "ns").await;
        match result {
            Err(Error::Apply { resource, .. }) => assert!(resource.contains("token")),
            other => panic!("expected apply error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restricted_kinds_are_unresolvable() {
        let cluster = InMemoryCluster::new();
        cluster.restrict_kinds(["Deployment"]).await;

        let result = cluster
            .delete(&ResourceId::new("Gadget", "ns", "x"))
            .await;
        assert!(matches!(result, Err(Error::UnknownKind { .. })));

        cluster
            .create(manifest("Deployment", "web", "1.0"), "ns")
            .await
            .unwrap();
    }
}
