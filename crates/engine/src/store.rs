//! Configuration-object storage at the platform boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tend_cluster::Version;
use tend_core::{Error, Result};

use crate::types::{GitOpsObject, ObjectKey};

/// Trait for the platform's typed storage of configuration objects.
///
/// `put` is the user-facing write (create or overwrite, no token); `update`
/// is the controller's optimistic-concurrency write-back and fails with
/// [`Error::Conflict`] on a stale token.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object with its version token.
    async fn get(&self, key: &ObjectKey) -> Result<Option<(GitOpsObject, Version)>>;

    /// List all stored objects.
    async fn list(&self) -> Result<Vec<(GitOpsObject, Version)>>;

    /// Create or overwrite an object unconditionally.
    async fn put(&self, object: GitOpsObject) -> Result<Version>;

    /// Update an object, guarded by its version token.
    async fn update(&self, object: GitOpsObject, expected: Version) -> Result<Version>;

    /// Delete an object. Deleting an absent object is a no-op.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// In-memory configuration-object store.
///
/// [`inject_update_conflicts`](Self::inject_update_conflicts) makes the next
/// n `update` calls fail with a conflict before applying, which is how tests
/// simulate out-of-band modification during a status write.
#[derive(Default)]
pub struct InMemoryObjects {
    objects: RwLock<HashMap<ObjectKey, (GitOpsObject, Version)>>,
    next_version: AtomicU64,
    injected_conflicts: AtomicU32,
}

impl InMemoryObjects {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` update calls fail with [`Error::Conflict`].
    pub fn inject_update_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    fn mint_version(&self) -> Version {
        Version::new(self.next_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjects {
    async fn get(&self, key: &ObjectKey) -> Result<Option<(GitOpsObject, Version)>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<(GitOpsObject, Version)>> {
        Ok(self.objects.read().await.values().cloned().collect())
    }

    async fn put(&self, object: GitOpsObject) -> Result<Version> {
        let version = self.mint_version();
        debug!(object = %object.key, version = %version, "object stored");
        self.objects
            .write()
            .await
            .insert(object.key.clone(), (object, version));
        Ok(version)
    }

    async fn update(&self, object: GitOpsObject, expected: Version) -> Result<Version> {
        if self.take_injected_conflict() {
            return Err(Error::conflict(
                object.key.to_string(),
                "simulated concurrent modification",
            ));
        }
        let mut objects = self.objects.write().await;
        let (_, current) = objects
            .get(&object.key)
            .ok_or_else(|| Error::not_found(object.key.to_string()))?;
        if *current != expected {
            return Err(Error::conflict(
                object.key.to_string(),
                format!("version token mismatch (expected {expected}, stored {current})"),
            ));
        }
        let version = self.mint_version();
        debug!(object = %object.key, version = %version, "object updated");
        objects.insert(object.key.clone(), (object, version));
        Ok(version)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        if self.objects.write().await.remove(key).is_some() {
            debug!(object = %key, "object deleted");
        }
        Ok(())
    }
}
