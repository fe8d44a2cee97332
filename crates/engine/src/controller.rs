//! Reconcile loop: drives configuration objects to convergence.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tend_cluster::SourceResolver;
use tend_core::{Error, Result};

use crate::apply::Applier;
use crate::dispatch::Dispatcher;
use crate::retry::{with_conflict_retry, RetryPolicy};
use crate::store::ObjectStore;
use crate::trigger::{self, TriggerDecision};
use crate::types::{Condition, DeletionMode, GitOpsObject, ObjectKey};

/// Phases of one object's reconciliation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Observed,
    TriggerCheck,
    Idle,
    Dispatching,
    Applying,
    Converged,
    Failed,
    Deleting,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Observed => "observed",
            Self::TriggerCheck => "trigger-check",
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::Applying => "applying",
            Self::Converged => "converged",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        };
        write!(f, "{name}")
    }
}

/// Configuration for the controller.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Retry policy for status and inventory write conflicts.
    pub retry: RetryPolicy,
}

/// Pending work flags for one object's worker.
///
/// Flags coalesce: any number of observations while a flow is in progress
/// collapse into a single deferred re-run, never a concurrent one.
#[derive(Debug, Default)]
struct PendingWork {
    reconcile: bool,
    deletion: Option<DeletionMode>,
    stop: bool,
}

#[derive(Default)]
struct WorkerSignal {
    work: Mutex<PendingWork>,
    notify: Notify,
}

struct Worker {
    signal: Arc<WorkerSignal>,
    handle: JoinHandle<()>,
}

struct Inner {
    objects: Arc<dyn ObjectStore>,
    resolver: Arc<dyn SourceResolver>,
    dispatcher: Arc<Dispatcher>,
    applier: Arc<Applier>,
    config: ControllerConfig,
}

/// Orchestrates reconciliation per configuration object.
///
/// Each object gets its own worker task; flows for distinct objects run
/// fully in parallel, while a single object's attempts are strictly
/// sequential. The status written back after every attempt reflects that
/// attempt's outcome.
pub struct Controller {
    inner: Arc<Inner>,
    workers: Mutex<HashMap<ObjectKey, Worker>>,
}

impl Controller {
    /// Create a new controller.
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        resolver: Arc<dyn SourceResolver>,
        dispatcher: Arc<Dispatcher>,
        applier: Arc<Applier>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects,
                resolver,
                dispatcher,
                applier,
                config,
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Note that an object was observed (created or updated) and schedule a
    /// reconciliation pass. Coalesces with any pass already pending.
    pub async fn observe(&self, key: &ObjectKey) {
        let signal = self.worker_for(key).await;
        {
            let mut work = signal.work.lock().await;
            if work.reconcile {
                debug!(object = %key, "reconciliation already pending, coalescing");
            }
            work.reconcile = true;
        }
        signal.notify.notify_one();
    }

    /// Note that an object was deleted and schedule cascading cleanup of
    /// its inventory per `mode`. An in-flight pass completes first.
    pub async fn observe_deleted(&self, key: &ObjectKey, mode: DeletionMode) {
        let signal = self.worker_for(key).await;
        {
            let mut work = signal.work.lock().await;
            work.deletion = Some(mode);
        }
        signal.notify.notify_one();
    }

    /// Schedule a pass for every stored object.
    ///
    /// # Errors
    ///
    /// Fails if the object store cannot be listed.
    pub async fn resync(&self) -> Result<()> {
        let objects = self.inner.objects.list().await?;
        debug!(objects = objects.len(), "resync pass");
        for (object, _) in objects {
            self.observe(&object.key).await;
        }
        Ok(())
    }

    /// Run one reconciliation pass inline, bypassing the worker queue.
    ///
    /// For embedders that manage their own scheduling and for tests; must
    /// not race `observe` for the same key.
    ///
    /// # Errors
    ///
    /// Returns the pass's failure after it has been recorded on status.
    pub async fn reconcile_now(&self, key: &ObjectKey) -> Result<()> {
        self.inner.reconcile_object(key).await
    }

    /// Run cascading cleanup inline, bypassing the worker queue.
    ///
    /// # Errors
    ///
    /// Fails like the deletion step of a convergence pass.
    pub async fn cleanup_now(&self, key: &ObjectKey, mode: DeletionMode) -> Result<()> {
        self.inner.cleanup_object(key, mode).await
    }

    /// Stop all workers and wait for them to finish their current step.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.values() {
            worker.signal.work.lock().await.stop = true;
            worker.signal.notify.notify_one();
        }
        let handles: Vec<JoinHandle<()>> =
            workers.drain().map(|(_, worker)| worker.handle).collect();
        drop(workers);
        let _ = join_all(handles).await;
        debug!("controller shut down");
    }

    async fn worker_for(&self, key: &ObjectKey) -> Arc<WorkerSignal> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(key) {
            return Arc::clone(&worker.signal);
        }
        let signal = Arc::new(WorkerSignal::default());
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.inner),
            key.clone(),
            Arc::clone(&signal),
        ));
        workers.insert(
            key.clone(),
            Worker {
                signal: Arc::clone(&signal),
                handle,
            },
        );
        signal
    }
}

/// One object's worker flow: strictly sequential, survives across object
/// deletion and recreation.
async fn run_worker(inner: Arc<Inner>, key: ObjectKey, signal: Arc<WorkerSignal>) {
    debug!(object = %key, "worker started");
    loop {
        signal.notify.notified().await;
        let work = {
            let mut work = signal.work.lock().await;
            std::mem::take(&mut *work)
        };
        if work.stop {
            debug!(object = %key, "worker stopped");
            return;
        }
        if let Some(mode) = work.deletion {
            if let Err(e) = inner.cleanup_object(&key, mode).await {
                error!(object = %key, error = %e, "cascading cleanup failed");
            }
        }
        if work.reconcile {
            // Failures are already recorded on status; the next due trigger
            // retries them.
            if let Err(e) = inner.reconcile_object(&key).await {
                debug!(object = %key, error = %e, "reconciliation pass failed");
            }
        }
    }
}

impl Inner {
    /// One full pass of the state machine for one object.
    async fn reconcile_object(&self, key: &ObjectKey) -> Result<()> {
        debug!(object = %key, phase = %ReconcilePhase::Observed, "reconciliation pass starting");
        let Some((object, _)) = self.objects.get(key).await? else {
            debug!(object = %key, "object no longer present, skipping");
            return Ok(());
        };

        let decision = match self.check_trigger(&object).await {
            Ok(decision) => decision,
            Err(e) => {
                self.record_failure(key, &e).await;
                return Err(e);
            }
        };
        if !decision.due {
            debug!(object = %key, phase = %ReconcilePhase::Idle, "no trigger due");
            return Ok(());
        }
        info!(
            object = %key,
            template_revision = %decision.revision.template,
            parameter_revision = %decision.revision.parameters,
            "reconciliation due"
        );

        debug!(object = %key, phase = %ReconcilePhase::Dispatching, "rendering sources");
        let manifests = match self.dispatcher.dispatch(&object).await {
            Ok(manifests) => manifests,
            Err(e) => {
                self.record_failure(key, &e).await;
                return Err(e);
            }
        };

        debug!(
            object = %key,
            phase = %ReconcilePhase::Applying,
            manifests = manifests.len(),
            "applying rendered manifest set"
        );
        let outcome = match self
            .applier
            .converge(
                key,
                &manifests,
                object.spec.resource_handling_mode,
                object.spec.resource_deletion_mode,
                decision.revision.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(key, &e).await;
                return Err(e);
            }
        };

        let revision = decision.revision;
        let count = outcome.tracked();
        let message = format!(
            "applied {count} resources at template revision {} / parameter revision {}",
            revision.template, revision.parameters
        );
        self.write_status(key, move |object| {
            object.status.last_processed = Some(revision.clone());
            object.status.applied_resource_count = count;
            object.status.record(Condition::converged(message.clone()));
            object.mark_converged();
        })
        .await?;
        info!(object = %key, phase = %ReconcilePhase::Converged, resources = count, "reconciliation converged");
        Ok(())
    }

    async fn check_trigger(&self, object: &GitOpsObject) -> Result<TriggerDecision> {
        debug!(object = %object.key, phase = %ReconcilePhase::TriggerCheck, "resolving source revisions");
        let template = self.resolver.resolve(&object.spec.template_source).await?;
        let parameters = self
            .resolver
            .resolve(&object.spec.parameter_source)
            .await?;
        trigger::evaluate(object, template, parameters)
    }

    async fn cleanup_object(&self, key: &ObjectKey, mode: DeletionMode) -> Result<()> {
        info!(object = %key, phase = %ReconcilePhase::Deleting, mode = ?mode, "cleaning up deleted object");
        self.applier.cleanup(key, mode).await
    }

    async fn record_failure(&self, key: &ObjectKey, failure: &Error) {
        warn!(
            object = %key,
            phase = %ReconcilePhase::Failed,
            error = %failure,
            transient = failure.is_transient(),
            "reconciliation failed"
        );
        let message = failure.to_string();
        if let Err(e) = self
            .write_status(key, move |object| {
                object.status.record(Condition::failed(message.clone()));
            })
            .await
        {
            error!(object = %key, error = %e, "failed to record failure condition");
        }
    }

    /// Optimistic-concurrency status write-back: on conflict, re-read the
    /// object and re-apply the mutation without redoing dispatch or apply.
    async fn write_status<F>(&self, key: &ObjectKey, mutate: F) -> Result<()>
    where
        F: Fn(&mut GitOpsObject),
    {
        let mutate = &mutate;
        with_conflict_retry(&self.config.retry, "status write", || {
            let objects = Arc::clone(&self.objects);
            let key = key.clone();
            async move {
                let Some((mut object, version)) = objects.get(&key).await? else {
                    // Deleted under us; nothing left to record on.
                    return Ok(());
                };
                mutate(&mut object);
                objects.update(object, version).await.map(|_| ())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;
    use crate::dispatch::DispatcherConfig;
    use crate::inventory::{InMemoryInventory, InventoryStore};
    use crate::store::InMemoryObjects;
    use crate::types::{ConditionKind, GitOpsSpec, HandlingMode, Trigger};
    use tend_cluster::{
        FixtureRepo, GitSource, InMemoryCluster, ResourceId, ResourceStore, SubstJobRunner,
    };

    const URI: &str = "https://example.com/fixtures";

    struct Fixture {
        objects: Arc<InMemoryObjects>,
        cluster: Arc<InMemoryCluster>,
        inventory: Arc<InMemoryInventory>,
        repo: Arc<FixtureRepo>,
        controller: Controller,
    }

    fn fixture() -> Fixture {
        let repo = FixtureRepo::new_arc();
        let objects = InMemoryObjects::new_arc();
        let cluster = InMemoryCluster::new_arc();
        let inventory = InMemoryInventory::new_arc();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SubstJobRunner::new(repo.clone())),
            DispatcherConfig::default(),
        ));
        let applier = Arc::new(Applier::new(
            cluster.clone(),
            inventory.clone(),
            RetryPolicy::default(),
        ));
        let controller = Controller::new(
            objects.clone(),
            repo.clone(),
            dispatcher,
            applier,
            ControllerConfig::default(),
        );
        Fixture {
            objects,
            cluster,
            inventory,
            repo,
            controller,
        }
    }

    async fn publish_deployment(repo: &FixtureRepo, revision: &str, tag: &str) {
        let template = format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  image: hello-app:{tag}"
        );
        repo.publish(
            URI,
            "main",
            revision,
            &[
                ("templates/deployment.yaml", template.as_str()),
                ("params/empty.yaml", "---"),
            ],
        )
        .await;
    }

    fn object(key: &ObjectKey) -> GitOpsObject {
        GitOpsObject::new(
            key.clone(),
            GitOpsSpec::new(
                GitSource::new(URI, "main", "templates"),
                GitSource::new(URI, "main", "params"),
            )
            .with_trigger(Trigger::Change)
            .with_handling(HandlingMode::Replace)
            .with_deletion(crate::types::DeletionMode::Delete)
            .with_processor_image("tend/processor:dev")
            .with_service_account("tend-operator"),
        )
    }

    #[tokio::test]
    async fn test_pass_converges_and_writes_status() {
        let f = fixture();
        publish_deployment(&f.repo, "rev-1", "1.0").await;
        let key = ObjectKey::new("ns", "app");
        f.objects.put(object(&key)).await.unwrap();

        f.controller.reconcile_now(&key).await.unwrap();

        let (stored, _) = f.objects.get(&key).await.unwrap().unwrap();
        assert!(stored.is_initialized());
        assert_eq!(stored.status.applied_resource_count, 1);
        assert_eq!(
            stored.status.last_condition().map(|c| c.kind),
            Some(ConditionKind::Converged)
        );
        assert!(f
            .cluster
            .get(&ResourceId::new("Deployment", "ns", "web"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_second_pass_is_idle() {
        let f = fixture();
        publish_deployment(&f.repo, "rev-1", "1.0").await;
        let key = ObjectKey::new("ns", "app");
        f.objects.put(object(&key)).await.unwrap();

        f.controller.reconcile_now(&key).await.unwrap();
        let (after_first, _) = f.objects.get(&key).await.unwrap().unwrap();

        f.controller.reconcile_now(&key).await.unwrap();
        let (after_second, _) = f.objects.get(&key).await.unwrap().unwrap();

        // Idle pass writes nothing.
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_fetch_failure_records_condition() {
        let f = fixture();
        // No fixture published: resolve fails.
        let key = ObjectKey::new("ns", "app");
        f.objects.put(object(&key)).await.unwrap();

        let result = f.controller.reconcile_now(&key).await;
        assert!(matches!(result, Err(Error::SourceFetch { .. })));

        let (stored, _) = f.objects.get(&key).await.unwrap().unwrap();
        assert_eq!(
            stored.status.last_condition().map(|c| c.kind),
            Some(ConditionKind::Failed)
        );
        assert!(!stored.is_initialized());
    }

    #[tokio::test]
    async fn test_failure_then_fix_reconverges() {
        let f = fixture();
        let key = ObjectKey::new("ns", "app");
        f.objects.put(object(&key)).await.unwrap();

        assert!(f.controller.reconcile_now(&key).await.is_err());

        // Fixing the source is enough; no separate retry action exists.
        publish_deployment(&f.repo, "rev-1", "1.0").await;
        f.controller.reconcile_now(&key).await.unwrap();

        let (stored, _) = f.objects.get(&key).await.unwrap().unwrap();
        assert_eq!(
            stored.status.last_condition().map(|c| c.kind),
            Some(ConditionKind::Converged)
        );
    }

    #[tokio::test]
    async fn test_worker_flow_converges() {
        let f = fixture();
        publish_deployment(&f.repo, "rev-1", "1.0").await;
        let key = ObjectKey::new("ns", "app");
        f.objects.put(object(&key)).await.unwrap();

        f.controller.observe(&key).await;

        let id = ResourceId::new("Deployment", "ns", "web");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if f.cluster.get(&id).await.unwrap().is_some() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker did not converge in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_deletion_cleans_up() {
        let f = fixture();
        publish_deployment(&f.repo, "rev-1", "1.0").await;
        let key = ObjectKey::new("ns", "app");
        f.objects.put(object(&key)).await.unwrap();
        f.controller.reconcile_now(&key).await.unwrap();

        f.objects.delete(&key).await.unwrap();
        f.controller
            .observe_deleted(&key, crate::types::DeletionMode::Delete)
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if f.inventory.load(&key).await.unwrap().is_none() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cleanup did not run in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.cluster.is_empty().await);
        f.controller.shutdown().await;
    }
}
