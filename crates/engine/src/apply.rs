//! Resource applier: converges live resources against a rendered set.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, info};

use tend_cluster::{Manifest, ResourceId, ResourceStore};
use tend_core::{Error, Result};

use crate::inventory::{InventoryEntry, InventoryStore};
use crate::retry::{with_conflict_retry, RetryPolicy};
use crate::types::{DeletionMode, HandlingMode, ObjectKey, ProcessedRevision};

/// What one convergence pass did, plus the inventory entry it persisted.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub created: Vec<ResourceId>,
    pub replaced: Vec<ResourceId>,
    pub untouched: Vec<ResourceId>,
    pub deleted: Vec<ResourceId>,
    pub released: Vec<ResourceId>,
    pub entry: Option<InventoryEntry>,
}

impl ApplyOutcome {
    /// Resources tracked by the persisted entry.
    pub fn tracked(&self) -> usize {
        self.entry.as_ref().map_or(0, InventoryEntry::len)
    }
}

/// Applies rendered manifest sets per handling/deletion policy.
///
/// One pass: classify against the prior inventory entry, create/replace in
/// render order, then delete removals, then persist the new entry. Deletion
/// is keyed purely on inventory membership, independent of the handling
/// mode. Creations and replacements always precede deletions so a renamed
/// resource never leaves a visible gap. Partial application is possible;
/// re-running the same set resumes safely because every mutation is
/// idempotent.
pub struct Applier {
    resources: Arc<dyn ResourceStore>,
    inventory: Arc<dyn InventoryStore>,
    retry: RetryPolicy,
}

impl Applier {
    /// Create a new applier.
    pub fn new(
        resources: Arc<dyn ResourceStore>,
        inventory: Arc<dyn InventoryStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            resources,
            inventory,
            retry,
        }
    }

    /// Converge live resources to `manifests` and persist the new inventory
    /// entry.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Apply`] naming the rejected resource (partial
    /// application preserved), [`Error::Conflict`] once per-resource retries
    /// are exhausted, or [`Error::InventoryCorruption`] when the prior entry
    /// references an unresolvable kind.
    pub async fn converge(
        &self,
        key: &ObjectKey,
        manifests: &[Manifest],
        handling: HandlingMode,
        deletion: DeletionMode,
        revision: ProcessedRevision,
    ) -> Result<ApplyOutcome> {
        let prior = self.inventory.load(key).await?.map(|(entry, _)| entry);

        // Step 1: classify. Duplicate identities within one render collapse
        // to the first occurrence.
        let rendered: Vec<(ResourceId, &Manifest)> = manifests
            .iter()
            .map(|m| (m.resource_id(&key.namespace), m))
            .unique_by(|(id, _)| id.clone())
            .collect_vec();
        let rendered_ids: BTreeSet<ResourceId> =
            rendered.iter().map(|(id, _)| id.clone()).collect();
        let removed: Vec<ResourceId> = prior
            .as_ref()
            .map(|entry| entry.resources.difference(&rendered_ids).cloned().collect())
            .unwrap_or_default();

        debug!(
            object = %key,
            rendered = rendered.len(),
            removed = removed.len(),
            handling = ?handling,
            deletion = ?deletion,
            "convergence pass"
        );

        let mut outcome = ApplyOutcome::default();

        // Step 2: creations and replacements, in render order.
        for (id, manifest) in &rendered {
            match handling {
                HandlingMode::Create => {
                    self.ensure_present(key, id, manifest, &mut outcome).await?;
                }
                HandlingMode::Replace => {
                    self.replace_resource(key, id, manifest, &mut outcome)
                        .await?;
                }
            }
        }

        // Step 3: deletions, keyed purely on inventory membership.
        for id in &removed {
            match deletion {
                DeletionMode::Delete => {
                    self.delete_resource(key, id).await?;
                    outcome.deleted.push(id.clone());
                }
                DeletionMode::Retain => {
                    debug!(resource = %id, "releasing ownership without deletion");
                    outcome.released.push(id.clone());
                }
            }
        }

        // Step 4: persist the entry immediately after the last mutation.
        let entry = InventoryEntry {
            resources: rendered_ids,
            revision,
        };
        self.save_entry(key, &entry).await?;
        info!(
            object = %key,
            created = outcome.created.len(),
            replaced = outcome.replaced.len(),
            deleted = outcome.deleted.len(),
            released = outcome.released.len(),
            tracked = entry.len(),
            "convergence pass complete"
        );
        outcome.entry = Some(entry);
        Ok(outcome)
    }

    /// Cascading cleanup after the owning object was deleted: remove or
    /// retain the tracked resources per `mode`, then drop the entry.
    ///
    /// # Errors
    ///
    /// Fails like the deletion step of [`converge`](Self::converge); the
    /// entry is only dropped once every tracked resource was handled.
    pub async fn cleanup(&self, key: &ObjectKey, mode: DeletionMode) -> Result<()> {
        let Some((entry, _)) = self.inventory.load(key).await? else {
            debug!(object = %key, "no inventory entry to clean up");
            return Ok(());
        };

        match mode {
            DeletionMode::Delete => {
                for id in &entry.resources {
                    self.delete_resource(key, id).await?;
                }
            }
            DeletionMode::Retain => {
                debug!(object = %key, resources = entry.len(), "retaining resources of deleted object");
            }
        }

        with_conflict_retry(&self.retry, "inventory remove", || {
            let inventory = Arc::clone(&self.inventory);
            let key = key.clone();
            async move {
                match inventory.load(&key).await? {
                    Some((_, version)) => inventory.remove(&key, version).await,
                    None => Ok(()),
                }
            }
        })
        .await
    }

    /// Create-mode handling: present resources are never overwritten,
    /// whether tracked or not.
    async fn ensure_present(
        &self,
        key: &ObjectKey,
        id: &ResourceId,
        manifest: &Manifest,
        outcome: &mut ApplyOutcome,
    ) -> Result<()> {
        if self.resources.get(id).await?.is_some() {
            debug!(resource = %id, "present, left untouched");
            outcome.untouched.push(id.clone());
            return Ok(());
        }
        match self.resources.create(manifest.clone(), &key.namespace).await {
            Ok(_) => {
                info!(resource = %id, "created");
                outcome.created.push(id.clone());
            }
            // Lost an out-of-band race; create mode never overwrites.
            Err(Error::AlreadyExists { .. }) => {
                debug!(resource = %id, "created out-of-band, left untouched");
                outcome.untouched.push(id.clone());
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Replace-mode handling: full replace, re-reading the version token on
    /// conflict.
    async fn replace_resource(
        &self,
        key: &ObjectKey,
        id: &ResourceId,
        manifest: &Manifest,
        outcome: &mut ApplyOutcome,
    ) -> Result<()> {
        let created = with_conflict_retry(&self.retry, "resource replace", || {
            let resources = Arc::clone(&self.resources);
            let manifest = manifest.clone();
            let id = id.clone();
            let namespace = key.namespace.clone();
            async move {
                match resources.get(&id).await? {
                    None => match resources.create(manifest, &namespace).await {
                        Ok(_) => Ok(true),
                        Err(Error::AlreadyExists { .. }) => Err(Error::conflict(
                            id.to_string(),
                            "created concurrently",
                        )),
                        Err(e) => Err(e),
                    },
                    Some(current) => {
                        resources
                            .replace(manifest, &namespace, current.version)
                            .await?;
                        Ok(false)
                    }
                }
            }
        })
        .await?;

        if created {
            info!(resource = %id, "created");
            outcome.created.push(id.clone());
        } else {
            info!(resource = %id, "replaced");
            outcome.replaced.push(id.clone());
        }
        Ok(())
    }

    async fn delete_resource(&self, key: &ObjectKey, id: &ResourceId) -> Result<()> {
        match self.resources.delete(id).await {
            Ok(()) => {
                info!(resource = %id, "deleted");
                Ok(())
            }
            Err(Error::UnknownKind { kind }) => Err(Error::inventory_corruption(
                key.to_string(),
                format!("entry references unresolvable kind '{kind}'"),
            )),
            Err(e) => Err(e),
        }
    }

    async fn save_entry(&self, key: &ObjectKey, entry: &InventoryEntry) -> Result<()> {
        with_conflict_retry(&self.retry, "inventory save", || {
            let inventory = Arc::clone(&self.inventory);
            let key = key.clone();
            let entry = entry.clone();
            async move {
                let current = inventory.load(&key).await?.map(|(_, version)| version);
                inventory.save(&key, entry, current).await.map(|_| ())
            }
        })
        .await
    }
}
