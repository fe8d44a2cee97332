//! GitOps reconciliation engine.
//!
//! A [`GitOpsObject`] pins a template source and a parameter source to git
//! references. The engine renders them into concrete resources, applies
//! them to the target environment per explicit handling/deletion policy,
//! and tracks an inventory so resources dropped from a render can be
//! removed.
//!
//! # Key Concepts
//!
//! ## Reconciliation
//!
//! The [`Controller`] runs one worker flow per object:
//! 1. Resolve both source revisions and evaluate triggers
//! 2. Dispatch an isolated templating job and collect its manifest set
//! 3. Converge live resources against the prior inventory entry
//! 4. Write status back with optimistic-concurrency retry
//!
//! ## Policies
//!
//! - [`HandlingMode`]: `Create` never overwrites present resources,
//!   `Replace` overwrites wholesale
//! - [`DeletionMode`]: `Delete` removes resources dropped from a render,
//!   `Retain` releases ownership and leaves them live
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tend_cluster::{FixtureRepo, InMemoryCluster, SubstJobRunner};
//! use tend_engine::{
//!     Applier, Controller, ControllerConfig, Dispatcher, DispatcherConfig,
//!     InMemoryInventory, InMemoryObjects, RetryPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let repo = FixtureRepo::new_arc();
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         Arc::new(SubstJobRunner::new(repo.clone())),
//!         DispatcherConfig::default(),
//!     ));
//!     let applier = Arc::new(Applier::new(
//!         InMemoryCluster::new_arc(),
//!         InMemoryInventory::new_arc(),
//!         RetryPolicy::default(),
//!     ));
//!     let controller = Controller::new(
//!         InMemoryObjects::new_arc(),
//!         repo,
//!         dispatcher,
//!         applier,
//!         ControllerConfig::default(),
//!     );
//!     // controller.observe(&key).await on every watch event
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod apply;
pub mod controller;
pub mod dispatch;
pub mod inventory;
pub mod r#loop;
pub mod retry;
pub mod store;
pub mod trigger;
pub mod types;

// Re-export main types
pub use apply::{Applier, ApplyOutcome};
pub use controller::{Controller, ControllerConfig, ReconcilePhase};
pub use dispatch::{Dispatcher, DispatcherConfig, JobId, JobOutcome, JobRecord};
pub use inventory::{InMemoryInventory, InventoryEntry, InventoryStore};
pub use r#loop::{LoopConfig, LoopStopper, ResyncLoop};
pub use retry::{with_conflict_retry, RetryPolicy};
pub use store::{InMemoryObjects, ObjectStore};
pub use trigger::{evaluate, TriggerDecision};
pub use types::{
    Condition, ConditionKind, DeletionMode, GitOpsObject, GitOpsSpec, HandlingMode, ObjectKey,
    ObjectStatus, ProcessedRevision, Trigger, ANNOTATION_FORCE_RECONCILE, ANNOTATION_INITIALIZED,
};
