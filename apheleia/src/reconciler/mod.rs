//! The three state machines and the entrypoint that dispatches a key to
//! the right one.
//!
//! Every reconcile re-derives status from the current state of the record
//! and its children and writes it back only if it changed. Nothing here
//! depends on having seen intermediate states, so replays and coalesced
//! events are safe.

mod artifact;
mod component;
mod dependency;

#[cfg(test)]
mod integration_tests;

pub use artifact::ArtifactBuildReconciler;
pub use component::ComponentBuildReconciler;
pub use dependency::DependencyBuildReconciler;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Instrument};

use crate::core::{Kind, ObjectKey};
use crate::dispatch::{Dispatched, Dispatcher};
use crate::errors::{ApheleiaError, Result};
use crate::events::{EventRecorder, ReconcileEvent};
use crate::observability::{reconcile_span, ReconcileTimer};
use crate::pipeline::PipelinePurpose;
use crate::store::ObjectStore;

/// What the controller should do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Wait for the next watch event.
    Done,
    /// Reconcile again after the delay even without an event.
    RequeueAfter(Duration),
}

impl ReconcileOutcome {
    /// Keeps the sooner of two requeue requests.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::RequeueAfter(a), Self::RequeueAfter(b)) => Self::RequeueAfter(a.min(b)),
            (Self::RequeueAfter(a), Self::Done) | (Self::Done, Self::RequeueAfter(a)) => {
                Self::RequeueAfter(a)
            }
            (Self::Done, Self::Done) => Self::Done,
        }
    }
}

/// Collaborators shared by the reconcilers.
#[derive(Clone)]
pub struct Context {
    /// The object store.
    pub store: Arc<dyn ObjectStore>,
    /// The pipeline dispatcher.
    pub dispatcher: Dispatcher,
    /// Where transition events go.
    pub events: Arc<dyn EventRecorder>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dispatcher: Dispatcher,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
        }
    }

    pub(crate) async fn record(&self, event: ReconcileEvent) {
        self.events.record(event).await;
    }

    pub(crate) async fn record_dispatch(
        &self,
        key: &ObjectKey,
        purpose: PipelinePurpose,
        dispatched: &Dispatched,
    ) {
        if dispatched.created {
            self.record(ReconcileEvent::PipelineRunCreated {
                key: key.clone(),
                purpose,
                run: dispatched.run.clone(),
            })
            .await;
        }
    }
}

/// Reconciles any key.
#[derive(Debug, Clone)]
pub struct Reconciler {
    component: ComponentBuildReconciler,
    artifact: ArtifactBuildReconciler,
    dependency: DependencyBuildReconciler,
}

impl Reconciler {
    /// Creates the reconciler set.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self {
            component: ComponentBuildReconciler::new(ctx.clone()),
            artifact: ArtifactBuildReconciler::new(ctx.clone()),
            dependency: DependencyBuildReconciler::new(ctx),
        }
    }

    /// Brings the record behind `key` one step closer to its desired state.
    ///
    /// A record that no longer exists is a successful no-op. A related
    /// record vanishing mid-reconcile is returned as an error so the key is
    /// retried.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let timer = ReconcileTimer::start(key);
        let result = async {
            match key.kind {
                Kind::ComponentBuild => self.component.reconcile(&key.namespace, &key.name).await,
                Kind::ArtifactBuild => self.artifact.reconcile(&key.namespace, &key.name).await,
                Kind::DependencyBuild => {
                    self.dependency.reconcile(&key.namespace, &key.name).await
                }
            }
        }
        .instrument(reconcile_span(key))
        .await;

        match result {
            Ok(outcome) => {
                timer.finish(if outcome == ReconcileOutcome::Done { "done" } else { "requeue" });
                Ok(outcome)
            }
            Err(ApheleiaError::NotFound { key: missing }) if missing == *key => {
                debug!(key = %key, "record disappeared during reconcile");
                timer.finish("gone");
                Ok(ReconcileOutcome::Done)
            }
            Err(err) => {
                timer.finish(err.code());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, TEST_NAMESPACE};

    #[tokio::test]
    async fn test_vanished_record_is_done() {
        let h = Harness::new();
        let key = ObjectKey::new(Kind::ArtifactBuild, TEST_NAMESPACE, "gone");
        assert_eq!(h.reconcile(&key).await.unwrap(), ReconcileOutcome::Done);
    }

    #[test]
    fn test_outcome_merge_keeps_soonest() {
        let a = ReconcileOutcome::RequeueAfter(Duration::from_secs(5));
        let b = ReconcileOutcome::RequeueAfter(Duration::from_secs(2));
        assert_eq!(a.merge(b), b);
        assert_eq!(ReconcileOutcome::Done.merge(a), a);
        assert_eq!(ReconcileOutcome::Done.merge(ReconcileOutcome::Done), ReconcileOutcome::Done);
    }
}
