//! Target-environment boundary for the tend reconciliation engine.
//!
//! The engine never talks to a live platform directly. Everything it needs
//! from the outside world is expressed as three async traits:
//!
//! - [`ResourceStore`] - typed resource storage with version-token
//!   compare-and-swap on replace and idempotent create/delete
//! - [`SourceResolver`] - resolve a pinned `{uri, reference, sub-path}`
//!   source to a content revision and fetch its directory tree
//! - [`JobRunner`] - execute one isolated templating task and collect the
//!   rendered manifest set
//!
//! In-memory implementations of all three ship here and back the test
//! suites: [`InMemoryCluster`], [`FixtureRepo`], and [`SubstJobRunner`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod job;
pub mod source;
pub mod store;
pub mod types;

pub use job::{JobRunner, RenderRequest, SubstJobRunner};
pub use source::{FixtureRepo, SourceResolver};
pub use store::{InMemoryCluster, ResourceStore};
pub use types::{GitSource, Manifest, ResourceId, Revision, SourceTree, StoredResource, Version};
