//! Trigger evaluation: decides whether a configuration object is due.

use tracing::debug;

use tend_cluster::Revision;
use tend_core::Result;

use crate::types::{GitOpsObject, ProcessedRevision, Trigger};

/// Outcome of one trigger evaluation. Transient: consumed by the reconcile
/// pass and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    /// Whether reconciliation is due.
    pub due: bool,
    /// The revision to record on a successful converge.
    pub revision: ProcessedRevision,
}

/// Evaluate whether `object` must be reconciled.
///
/// Pure decision over the recorded last-processed revision, the currently
/// resolved source revisions, and the annotations:
///
/// - a never-processed object is due regardless of triggers (initial apply)
/// - the force-reconcile annotation makes the object due unconditionally
/// - a `Change` trigger makes the object due when either source revision or
///   the spec hash differs from the recorded one
/// - with no triggers configured, an already-processed object is never due
///
/// # Errors
///
/// Returns [`tend_core::Error::Serialization`] if the spec hash cannot be
/// computed.
pub fn evaluate(
    object: &GitOpsObject,
    template: Revision,
    parameters: Revision,
) -> Result<TriggerDecision> {
    let revision = ProcessedRevision {
        template,
        parameters,
        spec_hash: object.spec.hash()?,
    };

    let due = match &object.status.last_processed {
        None => {
            debug!(object = %object.key, "never processed, initial apply due");
            true
        }
        Some(_) if object.force_reconcile_requested() => {
            debug!(object = %object.key, "manual re-trigger requested");
            true
        }
        Some(last) => object
            .spec
            .triggers
            .iter()
            .any(|trigger| match trigger {
                Trigger::Change => *last != revision,
            }),
    };

    Ok(TriggerDecision { due, revision })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{GitOpsSpec, HandlingMode, ObjectKey};
    use tend_cluster::GitSource;

    fn object_with_triggers(triggers: Vec<Trigger>) -> GitOpsObject {
        let mut spec = GitOpsSpec::new(
            GitSource::new("https://example.com/repo", "main", "templates"),
            GitSource::new("https://example.com/repo", "main", "params"),
        );
        spec.triggers = triggers;
        GitOpsObject::new(ObjectKey::new("ns", "app"), spec)
    }

    fn processed(object: &GitOpsObject, template: &str, parameters: &str) -> ProcessedRevision {
        ProcessedRevision {
            template: Revision::new(template),
            parameters: Revision::new(parameters),
            spec_hash: object.spec.hash().unwrap(),
        }
    }

    #[test]
    fn test_initial_apply_is_due_without_triggers() {
        let object = object_with_triggers(Vec::new());
        let decision =
            evaluate(&object, Revision::new("t1"), Revision::new("p1")).unwrap();
        assert!(decision.due);
    }

    #[test]
    fn test_processed_object_without_triggers_is_never_due() {
        let mut object = object_with_triggers(Vec::new());
        object.status.last_processed = Some(processed(&object, "t1", "p1"));

        // Even a moved template revision does not retrigger.
        let decision =
            evaluate(&object, Revision::new("t2"), Revision::new("p1")).unwrap();
        assert!(!decision.due);
    }

    #[test]
    fn test_change_trigger_fires_on_template_revision() {
        let mut object = object_with_triggers(vec![Trigger::Change]);
        object.status.last_processed = Some(processed(&object, "t1", "p1"));

        let same = evaluate(&object, Revision::new("t1"), Revision::new("p1")).unwrap();
        assert!(!same.due);

        let moved = evaluate(&object, Revision::new("t2"), Revision::new("p1")).unwrap();
        assert!(moved.due);
    }

    #[test]
    fn test_change_trigger_fires_on_parameter_revision() {
        let mut object = object_with_triggers(vec![Trigger::Change]);
        object.status.last_processed = Some(processed(&object, "t1", "p1"));

        let moved = evaluate(&object, Revision::new("t1"), Revision::new("p2")).unwrap();
        assert!(moved.due);
    }

    #[test]
    fn test_change_trigger_fires_on_spec_edit() {
        let mut object = object_with_triggers(vec![Trigger::Change]);
        object.status.last_processed = Some(processed(&object, "t1", "p1"));

        object.spec.resource_handling_mode = HandlingMode::Replace;
        let decision =
            evaluate(&object, Revision::new("t1"), Revision::new("p1")).unwrap();
        assert!(decision.due);
    }

    #[test]
    fn test_force_annotation_overrides_idle() {
        let mut object = object_with_triggers(Vec::new());
        object.status.last_processed = Some(processed(&object, "t1", "p1"));
        object.request_force_reconcile();

        let decision =
            evaluate(&object, Revision::new("t1"), Revision::new("p1")).unwrap();
        assert!(decision.due);
    }

    #[test]
    fn test_decision_carries_current_revisions() {
        let object = object_with_triggers(vec![Trigger::Change]);
        let decision =
            evaluate(&object, Revision::new("t9"), Revision::new("p9")).unwrap();
        assert_eq!(decision.revision.template, Revision::new("t9"));
        assert_eq!(decision.revision.parameters, Revision::new("p9"));
    }
}
