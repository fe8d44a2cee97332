//! Configuration-object model.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tend_cluster::{GitSource, Revision};
use tend_core::{Error, Result};

/// Annotation set once an object has been reconciled at least once.
pub const ANNOTATION_INITIALIZED: &str = "tend.io/initialized";

/// Annotation forcing the next trigger evaluation to be due regardless of
/// revision comparison. Cleared on successful converge.
pub const ANNOTATION_FORCE_RECONCILE: &str = "tend.io/force-reconcile";

/// Conditions kept per object before the oldest are dropped.
const MAX_CONDITION_HISTORY: usize = 8;

/// Namespace-qualified identity of a configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a new object key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Trigger descriptor marking when an object is due for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Trigger {
    /// Re-run when template or parameter source content differs from
    /// last-applied, or when the spec itself changed.
    Change,
}

/// Whether resources already present on the target are overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlingMode {
    /// Create resources that are absent; never overwrite present ones.
    Create,
    /// Create if absent, otherwise full replace.
    Replace,
}

/// Whether resources dropped from a render are removed from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionMode {
    /// Delete removed resources from the target.
    Delete,
    /// Leave removed resources in place, releasing ownership.
    Retain,
}

/// Desired-state half of a configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitOpsSpec {
    pub template_source: GitSource,
    pub parameter_source: GitSource,
    pub triggers: Vec<Trigger>,
    pub template_processor_image: String,
    pub resource_handling_mode: HandlingMode,
    pub resource_deletion_mode: DeletionMode,
    pub service_account: String,
}

impl GitOpsSpec {
    /// Create a spec with the least destructive policies: `Create`
    /// handling, `Retain` deletion, no triggers.
    pub fn new(template_source: GitSource, parameter_source: GitSource) -> Self {
        Self {
            template_source,
            parameter_source,
            triggers: Vec::new(),
            template_processor_image: String::new(),
            resource_handling_mode: HandlingMode::Create,
            resource_deletion_mode: DeletionMode::Retain,
            service_account: String::new(),
        }
    }

    /// Add a trigger.
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Set the template processor image.
    pub fn with_processor_image(mut self, image: impl Into<String>) -> Self {
        self.template_processor_image = image.into();
        self
    }

    /// Set the resource handling mode.
    pub fn with_handling(mut self, mode: HandlingMode) -> Self {
        self.resource_handling_mode = mode;
        self
    }

    /// Set the resource deletion mode.
    pub fn with_deletion(mut self, mode: DeletionMode) -> Self {
        self.resource_deletion_mode = mode;
        self
    }

    /// Set the service account the job and apply step run under.
    pub fn with_service_account(mut self, account: impl Into<String>) -> Self {
        self.service_account = account.into();
        self
    }

    /// Content hash of the spec, recorded in status so spec edits trigger
    /// reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the spec cannot be canonicalized.
    pub fn hash(&self) -> Result<String> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| Error::serialization(e.to_string()))?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("{digest:x}"))
    }
}

/// The source revisions and spec shape a successful converge processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRevision {
    pub template: Revision,
    pub parameters: Revision,
    pub spec_hash: String,
}

/// Condition kinds surfaced on object status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    Converged,
    Failed,
}

/// One status condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Condition {
    /// Create a converged condition.
    pub fn converged(message: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Converged,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a failed condition.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Failed,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Observed-state half of a configuration object, written back by the
/// controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub last_processed: Option<ProcessedRevision>,
    pub conditions: Vec<Condition>,
    pub applied_resource_count: usize,
}

impl ObjectStatus {
    /// Record a condition, dropping the oldest beyond the history cap.
    pub fn record(&mut self, condition: Condition) {
        self.conditions.push(condition);
        if self.conditions.len() > MAX_CONDITION_HISTORY {
            let excess = self.conditions.len() - MAX_CONDITION_HISTORY;
            self.conditions.drain(..excess);
        }
    }

    /// The most recent condition, if any.
    pub fn last_condition(&self) -> Option<&Condition> {
        self.conditions.last()
    }
}

/// The declarative unit describing one GitOps-managed deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitOpsObject {
    pub key: ObjectKey,
    pub spec: GitOpsSpec,
    pub annotations: BTreeMap<String, String>,
    pub status: ObjectStatus,
}

impl GitOpsObject {
    /// Create a new object with empty annotations and status.
    pub fn new(key: ObjectKey, spec: GitOpsSpec) -> Self {
        Self {
            key,
            spec,
            annotations: BTreeMap::new(),
            status: ObjectStatus::default(),
        }
    }

    /// Whether the object has been reconciled at least once.
    pub fn is_initialized(&self) -> bool {
        self.annotations
            .get(ANNOTATION_INITIALIZED)
            .is_some_and(|v| v == "true")
    }

    /// Whether a manual re-trigger was requested.
    pub fn force_reconcile_requested(&self) -> bool {
        self.annotations
            .get(ANNOTATION_FORCE_RECONCILE)
            .is_some_and(|v| v == "true")
    }

    /// Request a manual re-trigger.
    pub fn request_force_reconcile(&mut self) {
        self.annotations
            .insert(ANNOTATION_FORCE_RECONCILE.to_string(), "true".to_string());
    }

    /// Mark the object initialized and clear any pending re-trigger
    /// request. Called after a successful converge.
    pub fn mark_converged(&mut self) {
        self.annotations
            .insert(ANNOTATION_INITIALIZED.to_string(), "true".to_string());
        self.annotations.remove(ANNOTATION_FORCE_RECONCILE);
    }
}
