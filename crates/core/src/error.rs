//! Error types shared across the tend workspace.

use thiserror::Error;

/// Error type for reconciliation operations.
///
/// The templating phase fails with [`Error::SourceFetch`], [`Error::Render`]
/// or [`Error::DispatchTimeout`]; the apply phase with [`Error::Apply`] or
/// [`Error::Conflict`]. [`Error::Conflict`] is the only variant retried
/// locally - everything else surfaces as a failed condition on the owning
/// configuration object and waits for the next due trigger.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Templating phase
    #[error("failed to fetch source '{uri}': {reason}")]
    SourceFetch { uri: String, reason: String },

    #[error("template rendering failed: {reason}")]
    Render { reason: String },

    #[error("templating job for '{object}' exceeded {timeout_ms}ms")]
    DispatchTimeout { object: String, timeout_ms: u64 },

    // Apply phase
    #[error("target rejected resource '{resource}': {reason}")]
    Apply { resource: String, reason: String },

    #[error("concurrent modification of '{subject}': {reason}")]
    Conflict { subject: String, reason: String },

    // Inventory
    #[error("inventory for '{object}' is corrupt: {reason}")]
    InventoryCorruption { object: String, reason: String },

    // Platform boundary
    #[error("resource '{resource}' not found")]
    NotFound { resource: String },

    #[error("resource '{resource}' already exists")]
    AlreadyExists { resource: String },

    #[error("no resource type registered for kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl Error {
    /// Create a source fetch error.
    pub fn source_fetch(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceFetch {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create a render error.
    pub fn render(reason: impl Into<String>) -> Self {
        Self::Render {
            reason: reason.into(),
        }
    }

    /// Create a dispatch timeout error.
    pub fn dispatch_timeout(object: impl Into<String>, timeout_ms: u64) -> Self {
        Self::DispatchTimeout {
            object: object.into(),
            timeout_ms,
        }
    }

    /// Create an apply error naming the offending resource.
    pub fn apply(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Apply {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Create an inventory corruption error.
    pub fn inventory_corruption(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InventoryCorruption {
            object: object.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an already-exists error.
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Create an unknown-kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether this error is retried locally rather than surfaced.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether a retry without operator intervention can ever succeed.
    ///
    /// Durable failures (bad template, rejected resource) need a source or
    /// target fix; transient ones resolve on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::DispatchTimeout { .. } | Self::SourceFetch { .. }
        )
    }
}
