//! Shared harness for engine integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tend_cluster::{FixtureRepo, GitSource, InMemoryCluster, SubstJobRunner};
use tend_engine::{
    Applier, Controller, ControllerConfig, DeletionMode, Dispatcher, DispatcherConfig,
    GitOpsObject, GitOpsSpec, HandlingMode, InMemoryInventory, InMemoryObjects, ObjectKey,
    RetryPolicy, Trigger,
};

pub const URI: &str = "https://example.com/gitops-fixtures";
pub const NAMESPACE: &str = "gitops-e2e";

pub struct Harness {
    pub repo: Arc<FixtureRepo>,
    pub objects: Arc<InMemoryObjects>,
    pub cluster: Arc<InMemoryCluster>,
    pub inventory: Arc<InMemoryInventory>,
    pub dispatcher: Arc<Dispatcher>,
    pub applier: Arc<Applier>,
    pub controller: Controller,
}

pub fn harness() -> Harness {
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
        dispatcher.clone(),
        applier.clone(),
        ControllerConfig::default(),
    );
    Harness {
        repo,
        objects,
        cluster,
        inventory,
        dispatcher,
        applier,
        controller,
    }
}

/// A configuration object pointing at `template_dir` and `params_dir` of the
/// fixture repository, with a `Change` trigger.
pub fn gitops_object(
    name: &str,
    template_dir: &str,
    params_dir: &str,
    handling: HandlingMode,
    deletion: DeletionMode,
) -> GitOpsObject {
    GitOpsObject::new(
        ObjectKey::new(NAMESPACE, name),
        GitOpsSpec::new(
            GitSource::new(URI, "master", template_dir),
            GitSource::new(URI, "master", params_dir),
        )
        .with_trigger(Trigger::Change)
        .with_handling(handling)
        .with_deletion(deletion)
        .with_processor_image("tend/processor:dev")
        .with_service_account("tend-operator"),
    )
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
