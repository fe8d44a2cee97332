//! Inventory: durable record of which resources an object produced.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use tend_cluster::{ResourceId, Version};
use tend_core::{Error, Result};

use crate::types::{ObjectKey, ProcessedRevision};

/// The resource identities a configuration object most recently produced,
/// plus the revision that produced them.
///
/// Entries are keyed per object, so ownership never spans two configuration
/// objects and cross-object contention cannot occur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub resources: BTreeSet<ResourceId>,
    pub revision: ProcessedRevision,
}

impl InventoryEntry {
    /// Create an empty entry at a revision.
    pub fn new(revision: ProcessedRevision) -> Self {
        Self {
            resources: BTreeSet::new(),
            revision,
        }
    }

    /// Whether the entry tracks the given resource.
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains(id)
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the entry tracks no resources.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Trait for inventory persistence.
///
/// Read-modify-write cycles use the version token returned by `load`; a
/// stale token fails with [`Error::Conflict`] and callers retry through the
/// bounded conflict-retry combinator.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Load the entry for an object, with its version token.
    async fn load(&self, key: &ObjectKey) -> Result<Option<(InventoryEntry, Version)>>;

    /// Save an entry. `expected` must be `None` when creating the first
    /// entry and the current token when updating.
    async fn save(
        &self,
        key: &ObjectKey,
        entry: InventoryEntry,
        expected: Option<Version>,
    ) -> Result<Version>;

    /// Remove an entry, guarded by its version token.
    async fn remove(&self, key: &ObjectKey, expected: Version) -> Result<()>;
}

/// In-memory inventory store.
#[derive(Default)]
pub struct InMemoryInventory {
    entries: RwLock<HashMap<ObjectKey, (InventoryEntry, Version)>>,
    next_version: AtomicU64,
}

impl InMemoryInventory {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn mint_version(&self) -> Version {
        Version::new(self.next_version.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventory {
    async fn load(&self, key: &ObjectKey) -> Result<Option<(InventoryEntry, Version)>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(
        &self,
        key: &ObjectKey,
        entry: InventoryEntry,
        expected: Option<Version>,
    ) -> Result<Version> {
        let mut entries = self.entries.write().await;
        match (entries.get(key), expected) {
            (None, None) => {}
            (Some((_, current)), Some(expected)) if *current == expected => {}
            (Some((_, current)), _) => {
                return Err(Error::conflict(
                    format!("inventory/{key}"),
                    format!("version token mismatch (stored {current})"),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::conflict(
                    format!("inventory/{key}"),
                    "entry no longer exists",
                ));
            }
        }
        let version = self.mint_version();
        debug!(object = %key, version = %version, resources = entry.len(), "inventory entry saved");
        entries.insert(key.clone(), (entry, version));
        Ok(version)
    }

    async fn remove(&self, key: &ObjectKey, expected: Version) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            None => Ok(()),
            Some((_, current)) if *current == expected => {
                entries.remove(key);
                debug!(object = %key, "inventory entry removed");
                Ok(())
            }
            Some((_, current)) => Err(Error::conflict(
                format!("inventory/{key}"),
                format!("version token mismatch (stored {current})"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tend_cluster::Revision;

    fn entry(resources: &[(&str, &str, &str)]) -> InventoryEntry {
        let mut entry = InventoryEntry::new(ProcessedRevision {
            template: Revision::new("t1"),
            parameters: Revision::new("p1"),
            spec_hash: "hash".to_string(),
        });
        for (kind, namespace, name) in resources {
            entry.resources.insert(ResourceId::new(*kind, *namespace, *name));
        }
        entry
    }

    #[tokio::test]
    async fn test_first_save_requires_no_token() {
        let store = InMemoryInventory::new();
        let key = ObjectKey::new("ns", "app");

        let version = store
            .save(&key, entry(&[("Deployment", "ns", "web")]), None)
            .await
            .unwrap();

        let (loaded, loaded_version) = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded_version, version);
        assert!(loaded.contains(&ResourceId::new("Deployment", "ns", "web")));
    }

    #[tokio::test]
    async fn test_stale_token_conflicts() {
        let store = InMemoryInventory::new();
        let key = ObjectKey::new("ns", "app");
        let version = store.save(&key, entry(&[]), None).await.unwrap();

        // Another writer moved the entry.
        store
            .save(&key, entry(&[("Deployment", "ns", "web")]), Some(version))
            .await
            .unwrap();

        let stale = store.save(&key, entry(&[]), Some(version)).await;
        assert!(matches!(stale, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_create_over_existing_conflicts() {
        let store = InMemoryInventory::new();
        let key = ObjectKey::new("ns", "app");
        store.save(&key, entry(&[]), None).await.unwrap();

        let second = store.save(&key, entry(&[]), None).await;
        assert!(matches!(second, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_remove_with_current_token() {
        let store = InMemoryInventory::new();
        let key = ObjectKey::new("ns", "app");
        let version = store.save(&key, entry(&[]), None).await.unwrap();

        store.remove(&key, version).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_none());
    }
}
