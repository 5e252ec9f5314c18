//! `ComponentBuild` reconciler: ensures an owned `ArtifactBuild` per
//! requested GAV, aggregates their states, then deploys and reports the
//! result once per round.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Context, ReconcileOutcome};
use crate::core::{
    derive_state, ArtifactBuild, ArtifactState, ComponentBuild, ComponentBuildState,
    ComponentBuildStatus, Gav, Kind, ObjectKey, OwnerReference,
};
use crate::dispatch::RunProgress;
use crate::errors::Result;
use crate::events::ReconcileEvent;
use crate::pipeline::{PipelinePurpose, RunRef};
use crate::store::{Resource, TypedStore};

/// Reconciles `ComponentBuild` records.
#[derive(Debug, Clone)]
pub struct ComponentBuildReconciler {
    ctx: Context,
}

/// What the deploy and notify passes reported.
#[derive(Debug, Default)]
struct Delivery {
    requeue: Option<Duration>,
    problems: Vec<String>,
}

impl Delivery {
    fn requeue_after(&mut self, delay: Duration) {
        self.requeue = Some(self.requeue.map_or(delay, |d| d.min(delay)));
    }

    fn outcome(&self) -> ReconcileOutcome {
        self.requeue
            .map_or(ReconcileOutcome::Done, ReconcileOutcome::RequeueAfter)
    }
}

impl ComponentBuildReconciler {
    /// Creates the reconciler.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Reconciles one `ComponentBuild`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(cb) = self
            .ctx
            .store
            .find_typed::<ComponentBuild>(namespace, name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        let before = cb.status.clone();
        let (artifact_state, failures) = self.ensure_artifact_builds(&cb).await?;
        let (outstanding, state) = derive_state(artifact_state.values());

        let mut status = ComponentBuildStatus {
            state,
            outstanding,
            artifact_state,
            result_notified: before.result_notified,
            round: before.round,
            message: String::new(),
        };

        if before.state.is_terminal() && state != before.state {
            status.round = before.round.saturating_add(1);
            status.result_notified = false;
            info!(component = %cb.metadata.name, round = status.round, from = %before.state, to = %state, "result invalidated");
        } else {
            for (gav, current) in &mut status.artifact_state {
                let kept = before.artifact_state.get(gav).is_some_and(|p| p.deployed);
                current.deployed = kept && current.completed();
            }
        }
        if outstanding > 0 {
            status.result_notified = false;
        }

        let mut delivery = Delivery::default();
        if outstanding == 0 && !status.result_notified {
            self.deliver(&cb, &mut status, &mut delivery).await?;
        }

        let mut problems = failures;
        problems.append(&mut delivery.problems);
        status.message = problems.join("; ");

        let outcome = delivery.outcome();
        self.write_status(cb, &before, status).await?;
        Ok(outcome)
    }

    /// Ensures one owned `ArtifactBuild` per valid GAV and projects its state.
    ///
    /// Also returns one line per invalid GAV and per failed or missing
    /// artifact, for the status message.
    async fn ensure_artifact_builds(
        &self,
        cb: &ComponentBuild,
    ) -> Result<(BTreeMap<String, ArtifactState>, Vec<String>)> {
        let owner = OwnerReference::to(Kind::ComponentBuild, &cb.metadata, true)?;
        let mut projected = BTreeMap::new();
        let mut failures = Vec::new();

        for gav in &cb.spec.artifacts {
            let gav = gav.trim();
            if projected.contains_key(gav) {
                continue;
            }
            if Gav::parse(gav).is_err() {
                warn!(component = %cb.metadata.name, gav, "ignoring invalid GAV");
                projected.insert(gav.to_string(), ArtifactState::invalid());
                failures.push(format!("invalid GAV '{gav}'"));
                continue;
            }

            let mut candidate = ArtifactBuild::new(cb.metadata.namespace.clone(), gav);
            candidate.metadata.add_owner(owner.clone());
            let (mut abr, created) = self.ctx.store.get_or_create(candidate).await?;
            if created {
                debug!(component = %cb.metadata.name, gav, "created artifact build");
            } else if abr.metadata.add_owner(owner.clone()) {
                debug!(component = %cb.metadata.name, gav, "adopting existing artifact build");
                abr = self.ctx.store.update_typed(abr).await?;
            }

            let state = abr.status.state;
            if state.is_failure() {
                failures.push(if abr.status.message.is_empty() {
                    format!("{gav} {state}")
                } else {
                    format!("{gav} {state}: {}", abr.status.message)
                });
            }
            projected.insert(gav.to_string(), ArtifactState::project(abr.metadata.name, state));
        }
        Ok((projected, failures))
    }

    /// Deploys every completed artifact of the round, then notifies once
    /// all deploys have settled.
    async fn deliver(
        &self,
        cb: &ComponentBuild,
        status: &mut ComponentBuildStatus,
        delivery: &mut Delivery,
    ) -> Result<()> {
        let key = cb.key();
        let round = status.round;
        let mut settled = true;

        for (gav, artifact) in &mut status.artifact_state {
            if !artifact.completed() || artifact.deployed {
                continue;
            }
            match self.ctx.dispatcher.deploy(&key, round, gav).await? {
                RunProgress::Succeeded(_) => artifact.deployed = true,
                RunProgress::InFlight(_) => settled = false,
                RunProgress::Started(run) => {
                    settled = false;
                    self.record_run(&key, PipelinePurpose::Deploy, run).await;
                }
                RunProgress::RetryAfter { last, delay } => {
                    settled = false;
                    delivery.requeue_after(delay);
                    delivery
                        .problems
                        .push(format!("deploy of {gav} failed, check run {last}; retrying"));
                }
                RunProgress::Exhausted { last, attempts } => {
                    delivery.problems.push(format!(
                        "deploy of {gav} failed after {attempts} attempts, check run {last}"
                    ));
                }
            }
        }
        if !settled {
            return Ok(());
        }

        if self.ctx.dispatcher.config().notify.disabled {
            status.result_notified = true;
            return Ok(());
        }

        let summary = summarize(status, &delivery.problems);
        let progress = self
            .ctx
            .dispatcher
            .notify(&key, round, status.state, &summary, &cb.spec.pr_url)
            .await?;
        match progress {
            RunProgress::Succeeded(run) => {
                info!(component = %cb.metadata.name, %run, round, "result reported");
                status.result_notified = true;
            }
            RunProgress::InFlight(_) => {}
            RunProgress::Started(run) => self.record_run(&key, PipelinePurpose::Notify, run).await,
            RunProgress::RetryAfter { last, delay } => {
                delivery.requeue_after(delay);
                delivery
                    .problems
                    .push(format!("notification failed, check run {last}; retrying"));
            }
            RunProgress::Exhausted { last, attempts } => {
                delivery.problems.push(format!(
                    "notification failed after {attempts} attempts, check run {last}"
                ));
            }
        }
        Ok(())
    }

    async fn record_run(&self, key: &ObjectKey, purpose: PipelinePurpose, run: RunRef) {
        self.ctx
            .record(ReconcileEvent::PipelineRunCreated {
                key: key.clone(),
                purpose,
                run,
            })
            .await;
    }

    async fn write_status(
        &self,
        mut cb: ComponentBuild,
        before: &ComponentBuildStatus,
        status: ComponentBuildStatus,
    ) -> Result<()> {
        if *before == status {
            return Ok(());
        }
        let key = cb.key();
        let (from, to, outstanding) = (before.state, status.state, status.outstanding);
        cb.status = status;
        self.ctx.store.update_status_typed(cb).await?;
        if from != to {
            info!(component = %key.name, %from, %to, outstanding, "component build state changed");
            self.ctx
                .record(ReconcileEvent::ComponentBuildStateChanged {
                    key,
                    from,
                    to,
                    outstanding,
                })
                .await;
        }
        Ok(())
    }
}

/// The message sent with the notification.
fn summarize(status: &ComponentBuildStatus, problems: &[String]) -> String {
    let failed: Vec<&str> = status
        .artifact_state
        .iter()
        .filter(|(_, a)| a.failed)
        .map(|(gav, _)| gav.as_str())
        .collect();
    let total = status.artifact_state.len();

    let mut summary = if failed.is_empty() {
        format!("all {total} artifacts rebuilt")
    } else {
        format!("{} of {total} artifacts failed: {}", failed.len(), failed.join(", "))
    };
    if !problems.is_empty() {
        summary.push_str("; ");
        summary.push_str(&problems.join("; "));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactBuildState, ArtifactBuildStatus};
    use crate::testing::Harness;
    use pretty_assertions::assert_eq;

    const A: &str = "org.acme:a:1.0";
    const B: &str = "org.acme:b:1.0";

    async fn finish(h: &Harness, gav: &str, state: ArtifactBuildState) {
        h.set_artifact_status(
            gav,
            ArtifactBuildStatus {
                state,
                ..ArtifactBuildStatus::default()
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_creates_owned_artifact_builds_once() {
        let h = Harness::new();
        let cb = h.create_component("cb", &[A, B, A]).await;

        h.reconcile(&cb.key()).await.unwrap();
        h.reconcile(&cb.key()).await.unwrap();

        let abrs = h.artifact_builds().await;
        assert_eq!(abrs.len(), 2);
        assert!(abrs.iter().all(|a| a.metadata.is_owned_by(cb.metadata.uid)));

        let cb = h.component("cb").await;
        assert_eq!(cb.status.state, ComponentBuildState::InProgress);
        assert_eq!(cb.status.outstanding, 2);
    }

    #[tokio::test]
    async fn test_adopts_existing_artifact_build() {
        let h = Harness::new();
        let existing = h.create_artifact(A).await;
        let cb = h.create_component("cb", &[A]).await;

        h.reconcile(&cb.key()).await.unwrap();

        let abr = h.artifact(A).await;
        assert_eq!(abr.metadata.uid, existing.metadata.uid);
        assert!(abr.metadata.is_owned_by(cb.metadata.uid));
    }

    #[tokio::test]
    async fn test_invalid_gav_counts_as_failed() {
        let h = Harness::new();
        let cb = h.create_component("cb", &[A, "not-a-gav"]).await;
        h.reconcile(&cb.key()).await.unwrap();

        let cb = h.component("cb").await;
        assert_eq!(cb.status.outstanding, 1);
        assert!(cb.status.artifact_state["not-a-gav"].failed);
        assert!(cb.status.message.contains("invalid GAV 'not-a-gav'"));
        assert_eq!(h.artifact_builds().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_artifacts_are_named_in_message() {
        let h = Harness::new();
        let cb = h.create_component("cb", &[A, B]).await;
        h.reconcile(&cb.key()).await.unwrap();
        h.set_artifact_status(
            A,
            ArtifactBuildStatus {
                state: ArtifactBuildState::Failed,
                message: "dependency build r1 failed".to_string(),
                ..ArtifactBuildStatus::default()
            },
        )
        .await;
        finish(&h, B, ArtifactBuildState::Missing).await;

        h.reconcile(&cb.key()).await.unwrap();

        let cb = h.component("cb").await;
        assert_eq!(cb.status.state, ComponentBuildState::Failed);
        assert_eq!(
            cb.status.message,
            "org.acme:a:1.0 Failed: dependency build r1 failed; org.acme:b:1.0 Missing"
        );
    }

    #[tokio::test]
    async fn test_complete_deploys_then_notifies_once() {
        let h = Harness::new();
        let cb = h.create_component("cb", &[A]).await;
        h.reconcile(&cb.key()).await.unwrap();
        finish(&h, A, ArtifactBuildState::Complete).await;

        h.reconcile(&cb.key()).await.unwrap();
        let deploys = h.backend.runs_for(PipelinePurpose::Deploy);
        assert_eq!(deploys.len(), 1);
        assert_eq!(deploys[0].params["GAV"], A);
        assert!(h.backend.runs_for(PipelinePurpose::Notify).is_empty());

        h.complete_all(PipelinePurpose::Deploy, true);
        h.reconcile(&cb.key()).await.unwrap();
        let notifies = h.backend.runs_for(PipelinePurpose::Notify);
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0].params["STATE"], "Complete");

        h.complete_all(PipelinePurpose::Notify, true);
        h.reconcile(&cb.key()).await.unwrap();
        h.reconcile(&cb.key()).await.unwrap();

        let cb = h.component("cb").await;
        assert_eq!(cb.status.state, ComponentBuildState::Complete);
        assert!(cb.status.result_notified);
        assert!(cb.status.artifact_state[A].deployed);
        assert_eq!(h.backend.runs_for(PipelinePurpose::Notify).len(), 1);
        assert_eq!(h.backend.runs_for(PipelinePurpose::Deploy).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_component_skips_failed_artifacts_in_deploy() {
        let h = Harness::new();
        let cb = h.create_component("cb", &[A, B]).await;
        h.reconcile(&cb.key()).await.unwrap();
        finish(&h, A, ArtifactBuildState::Complete).await;
        finish(&h, B, ArtifactBuildState::Missing).await;

        h.reconcile(&cb.key()).await.unwrap();
        let deploys = h.backend.runs_for(PipelinePurpose::Deploy);
        assert_eq!(deploys.len(), 1);
        assert_eq!(deploys[0].params["GAV"], A);

        h.complete_all(PipelinePurpose::Deploy, true);
        h.reconcile(&cb.key()).await.unwrap();
        let notify = &h.backend.runs_for(PipelinePurpose::Notify)[0];
        assert_eq!(notify.params["STATE"], "Failed");
        assert!(notify.params["MESSAGE"].contains(B));
    }

    #[tokio::test]
    async fn test_deploy_failure_is_recorded_and_retried() {
        let h = Harness::with_retry(2, 0);
        let cb = h.create_component("cb", &[A]).await;
        h.reconcile(&cb.key()).await.unwrap();
        finish(&h, A, ArtifactBuildState::Complete).await;

        h.reconcile(&cb.key()).await.unwrap();
        h.complete_all(PipelinePurpose::Deploy, false);
        h.reconcile(&cb.key()).await.unwrap();
        assert_eq!(h.backend.runs_for(PipelinePurpose::Deploy).len(), 2);

        h.complete_all(PipelinePurpose::Deploy, false);
        h.reconcile(&cb.key()).await.unwrap();

        let cb = h.component("cb").await;
        assert!(cb.status.message.contains("failed after 2 attempts"));
        assert!(!cb.status.artifact_state[A].deployed);
        // Deploys are settled, so the (failed) result is still reported.
        assert_eq!(h.backend.runs_for(PipelinePurpose::Notify).len(), 1);
    }

    #[tokio::test]
    async fn test_regression_opens_new_round() {
        let h = Harness::new();
        let cb = h.create_component("cb", &[A]).await;
        h.reconcile(&cb.key()).await.unwrap();
        finish(&h, A, ArtifactBuildState::Complete).await;
        h.reconcile(&cb.key()).await.unwrap();
        h.complete_all(PipelinePurpose::Deploy, true);
        h.reconcile(&cb.key()).await.unwrap();
        h.complete_all(PipelinePurpose::Notify, true);
        h.reconcile(&cb.key()).await.unwrap();
        assert!(h.component("cb").await.status.result_notified);

        finish(&h, A, ArtifactBuildState::New).await;
        h.reconcile(&cb.key()).await.unwrap();
        let reopened = h.component("cb").await;
        assert_eq!(reopened.status.state, ComponentBuildState::InProgress);
        assert_eq!(reopened.status.round, 1);
        assert!(!reopened.status.result_notified);
        assert!(!reopened.status.artifact_state[A].deployed);

        finish(&h, A, ArtifactBuildState::Complete).await;
        h.reconcile(&cb.key()).await.unwrap();
        let deploys = h.backend.runs_for(PipelinePurpose::Deploy);
        assert_eq!(deploys.len(), 2);
        assert_eq!(deploys[1].subject.as_deref(), Some("1:org.acme:a:1.0"));
    }

    #[test]
    fn test_summarize() {
        let mut status = ComponentBuildStatus::default();
        status
            .artifact_state
            .insert(A.to_string(), ArtifactState::project("a", ArtifactBuildState::Complete));
        assert_eq!(summarize(&status, &[]), "all 1 artifacts rebuilt");

        status
            .artifact_state
            .insert(B.to_string(), ArtifactState::project("b", ArtifactBuildState::Failed));
        assert_eq!(
            summarize(&status, &["deploy broke".to_string()]),
            "1 of 2 artifacts failed: org.acme:b:1.0; deploy broke"
        );
    }
}
