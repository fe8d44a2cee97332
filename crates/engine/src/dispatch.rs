//! Templating-job dispatch and execution-record retention.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use tend_cluster::{JobRunner, Manifest, RenderRequest};
use tend_core::{Error, Result};

use crate::types::{GitOpsObject, ObjectKey};

/// Unique identifier for one templating-job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Ulid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How one templating-job execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded { manifest_count: usize },
    Failed { error: String },
    TimedOut,
}

/// Diagnostic record of one templating-job execution. Retained in the
/// dispatcher's history regardless of reconciliation success and pruned by
/// count and age policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub object: ObjectKey,
    pub image: String,
    pub service_account: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bounded execution window for one templating job.
    pub dispatch_timeout: Duration,
    /// Job records kept before the oldest are pruned.
    pub max_history: usize,
    /// Job records older than this are pruned.
    pub max_record_age: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(300),
            max_history: 50,
            max_record_age: chrono::Duration::hours(24),
        }
    }
}

/// Launches isolated rendering tasks and collects their manifest sets.
///
/// A failed dispatch leaves the previous inventory and live resources
/// untouched; the only side effect is the job record.
pub struct Dispatcher {
    runner: Arc<dyn JobRunner>,
    config: DispatcherConfig,
    history: RwLock<VecDeque<JobRecord>>,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(runner: Arc<dyn JobRunner>, config: DispatcherConfig) -> Self {
        Self {
            runner,
            config,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Render the object's sources into a manifest set.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::SourceFetch`] or [`Error::Render`] from the
    /// runner, or [`Error::DispatchTimeout`] when the bounded execution
    /// window expires.
    pub async fn dispatch(&self, object: &GitOpsObject) -> Result<Vec<Manifest>> {
        let request = RenderRequest {
            template: object.spec.template_source.clone(),
            parameters: object.spec.parameter_source.clone(),
            processor_image: object.spec.template_processor_image.clone(),
            service_account: object.spec.service_account.clone(),
        };
        let id = JobId::new();
        let started_at = Utc::now();
        info!(
            object = %object.key,
            job = %id,
            image = %request.processor_image,
            "dispatching templating job"
        );

        let result =
            tokio::time::timeout(self.config.dispatch_timeout, self.runner.run(&request)).await;

        let (outcome, result) = match result {
            Ok(Ok(manifests)) => {
                debug!(object = %object.key, job = %id, manifests = manifests.len(), "templating job succeeded");
                (
                    JobOutcome::Succeeded {
                        manifest_count: manifests.len(),
                    },
                    Ok(manifests),
                )
            }
            Ok(Err(e)) => {
                warn!(object = %object.key, job = %id, error = %e, "templating job failed");
                (
                    JobOutcome::Failed {
                        error: e.to_string(),
                    },
                    Err(e),
                )
            }
            Err(_) => {
                let timeout_ms = self.config.dispatch_timeout.as_millis() as u64;
                warn!(object = %object.key, job = %id, timeout_ms, "templating job timed out");
                (
                    JobOutcome::TimedOut,
                    Err(Error::dispatch_timeout(object.key.to_string(), timeout_ms)),
                )
            }
        };

        self.record(JobRecord {
            id,
            object: object.key.clone(),
            image: request.processor_image,
            service_account: request.service_account,
            started_at,
            finished_at: Utc::now(),
            outcome,
        })
        .await;

        result
    }

    /// All retained job records, oldest first.
    pub async fn history(&self) -> Vec<JobRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Retained job records for one object, oldest first.
    pub async fn history_for(&self, key: &ObjectKey) -> Vec<JobRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.object == *key)
            .cloned()
            .collect()
    }

    /// Prune records beyond the count cap or older than the age cap.
    pub async fn gc(&self) {
        let cutoff = Utc::now() - self.config.max_record_age;
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|r| r.finished_at > cutoff);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
        if history.len() < before {
            debug!(pruned = before - history.len(), "job records pruned");
        }
    }

    async fn record(&self, record: JobRecord) {
        self.history.write().await.push_back(record);
        self.gc().await;
    }
}
