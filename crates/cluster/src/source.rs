//! Source-control retrieval trait and in-memory fixture repository.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tend_core::{Error, Result};

use crate::types::{GitSource, Revision, SourceTree};

/// Trait for resolving and fetching pinned repository sources.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve a pinned source to its current content revision without
    /// fetching the tree.
    async fn resolve(&self, source: &GitSource) -> Result<Revision>;

    /// Fetch the directory tree under the source's context dir at its
    /// pinned reference.
    async fn fetch(&self, source: &GitSource) -> Result<SourceTree>;
}

struct RefState {
    revision: Revision,
    files: BTreeMap<String, String>,
}

/// In-memory repository of registered fixtures.
///
/// [`publish`](Self::publish) registers a reference or moves it to a new
/// revision, which is how tests model a git push.
#[derive(Default)]
pub struct FixtureRepo {
    refs: RwLock<HashMap<(String, String), RefState>>,
}

impl FixtureRepo {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty repository wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a reference at a revision, or advance it if already known.
    ///
    /// `files` are repository-relative paths with their content; they fully
    /// replace any tree previously published for the reference.
    pub async fn publish(
        &self,
        uri: impl Into<String>,
        reference: impl Into<String>,
        revision: impl Into<String>,
        files: &[(&str, &str)],
    ) {
        let uri = uri.into();
        let reference = reference.into();
        let revision = Revision::new(revision);
        debug!(uri = %uri, reference = %reference, revision = %revision, files = files.len(), "publishing fixture revision");
        let files = files
            .iter()
            .map(|(path, content)| ((*path).to_string(), (*content).to_string()))
            .collect();
        self.refs
            .write()
            .await
            .insert((uri, reference), RefState { revision, files });
    }
}

#[async_trait]
impl SourceResolver for FixtureRepo {
    async fn resolve(&self, source: &GitSource) -> Result<Revision> {
        let refs = self.refs.read().await;
        let state = refs
            .get(&(source.uri.clone(), source.reference.clone()))
            .ok_or_else(|| {
                Error::source_fetch(
                    &source.uri,
                    format!("unknown repository or reference '{}'", source.reference),
                )
            })?;
        Ok(state.revision.clone())
    }

    async fn fetch(&self, source: &GitSource) -> Result<SourceTree> {
        let refs = self.refs.read().await;
        let state = refs
            .get(&(source.uri.clone(), source.reference.clone()))
            .ok_or_else(|| {
                Error::source_fetch(
                    &source.uri,
                    format!("unknown repository or reference '{}'", source.reference),
                )
            })?;

        let prefix = if source.context_dir.is_empty() {
            String::new()
        } else {
            format!("{}/", source.context_dir.trim_end_matches('/'))
        };

        let mut tree = SourceTree::new();
        for (path, content) in &state.files {
            if let Some(relative) = path.strip_prefix(&prefix) {
                tree.insert(relative, content.clone());
            }
        }
        if tree.is_empty() && !prefix.is_empty() {
            return Err(Error::source_fetch(
                &source.uri,
                format!(
                    "path '{}' not found at revision {}",
                    source.context_dir, state.revision
                ),
            ));
        }
        Ok(tree)
    }
}
