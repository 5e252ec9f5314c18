//! `DependencyBuild` state machine.

use tracing::{debug, info, warn};

use super::{Context, ReconcileOutcome};
use crate::core::{
    ArtifactBuild, ArtifactBuildState, Contaminant, DependencyBuild, DependencyBuildState,
    DependencyBuildStatus,
};
use crate::errors::Result;
use crate::events::ReconcileEvent;
use crate::identity::{artifact_build_name, contaminated_by_annotation};
use crate::pipeline::results::{self, BuildResult};
use crate::pipeline::PipelinePurpose;
use crate::store::{Resource, TypedStore};

/// Reconciles `DependencyBuild` records.
///
/// This reconciler is the only writer of `DependencyBuild` status, so
/// contamination is both recorded and cleared here.
#[derive(Debug, Clone)]
pub struct DependencyBuildReconciler {
    ctx: Context,
}

impl DependencyBuildReconciler {
    /// Creates the reconciler.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Reconciles one `DependencyBuild`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(db) = self
            .ctx
            .store
            .find_typed::<DependencyBuild>(namespace, name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if db.metadata.owner_references.is_empty() {
            let key = db.key();
            if self.ctx.store.delete_if_exists(&key).await? {
                info!(dependency_build = %key.name, "deleted dependency build with no owners");
                self.ctx
                    .record(ReconcileEvent::DependencyBuildDeleted { key })
                    .await;
            }
            return Ok(ReconcileOutcome::Done);
        }

        let before = db.status.clone();
        let mut next = db.clone();
        match before.state {
            DependencyBuildState::New => self.start_build(&mut next).await?,
            DependencyBuildState::Building => self.await_build(&mut next).await?,
            DependencyBuildState::Contaminated => self.clear_contaminants(&mut next).await?,
            DependencyBuildState::Complete | DependencyBuildState::Failed => {}
        }

        self.write_status(&before, next).await?;
        Ok(ReconcileOutcome::Done)
    }

    async fn start_build(&self, db: &mut DependencyBuild) -> Result<()> {
        let key = db.key();
        let dispatched = self
            .ctx
            .dispatcher
            .start_build(&key, &db.spec.scm_info, &db.spec.version)
            .await?;
        self.ctx
            .record_dispatch(&key, PipelinePurpose::Build, &dispatched)
            .await;

        db.status.state = DependencyBuildState::Building;
        db.status.build_run = Some(dispatched.run);
        db.status.message.clear();
        Ok(())
    }

    async fn await_build(&self, db: &mut DependencyBuild) -> Result<()> {
        let Some(run_ref) = db.status.build_run.clone() else {
            return self.start_build(db).await;
        };
        let run = self.ctx.dispatcher.get_run(&run_ref).await?;
        if run.in_flight() {
            return Ok(());
        }

        if !run.succeeded {
            db.status.state = DependencyBuildState::Failed;
            db.status.message = run
                .result(results::MESSAGE)
                .map_or_else(|| format!("build run {run_ref} failed"), ToString::to_string);
            db.status.deployed_artifacts.clear();
            warn!(dependency_build = %db.metadata.name, run = %run_ref, "build failed");
            return Ok(());
        }

        let result = match BuildResult::from_run(&run) {
            Ok(result) => result,
            Err(err) => {
                db.status.state = DependencyBuildState::Failed;
                db.status.message = format!("build run {run_ref} reported malformed results: {err}");
                warn!(dependency_build = %db.metadata.name, run = %run_ref, error = %err, "malformed build results");
                return Ok(());
            }
        };

        let deployed = result.deployed_artifacts;
        let contaminants: Vec<Contaminant> = result
            .contaminants
            .into_iter()
            .filter(|c| !deployed.contains(&c.gav))
            .collect();

        db.status.deployed_artifacts = deployed;
        db.status.contaminants.clear();
        db.status.merge_contaminants(contaminants);
        db.status.message = result.message.unwrap_or_default();

        if db.status.contaminants.is_empty() {
            db.status.state = DependencyBuildState::Complete;
            return Ok(());
        }

        db.status.state = DependencyBuildState::Contaminated;
        let key = db.key();
        for contaminant in db.status.contaminants.clone() {
            self.request_contaminant_rebuild(db, &contaminant.gav).await?;
            warn!(dependency_build = %key.name, gav = %contaminant.gav, "contaminant found");
            self.ctx
                .record(ReconcileEvent::ContaminantDiscovered {
                    key: key.clone(),
                    gav: contaminant.gav,
                    contaminated_artifacts: contaminant.contaminated_artifacts,
                })
                .await;
        }
        Ok(())
    }

    /// Ensures an `ArtifactBuild` exists for a contaminant and links it back
    /// to this build, so its progress re-triggers this build.
    ///
    /// The link is an annotation rather than an owner reference: the
    /// contaminant's lifetime is not tied to this build.
    async fn request_contaminant_rebuild(
        &self,
        db: &DependencyBuild,
        gav: &str,
    ) -> Result<ArtifactBuild> {
        let link = contaminated_by_annotation(&db.metadata.name);
        let mut candidate = ArtifactBuild::new(db.metadata.namespace.clone(), gav);
        candidate
            .metadata
            .set_annotation(link.clone(), db.metadata.name.clone());

        let (mut abr, created) = self.ctx.store.get_or_create(candidate).await?;
        if created {
            info!(gav, dependency_build = %db.metadata.name, "requested rebuild of contaminant");
        } else if abr.metadata.set_annotation(link, db.metadata.name.clone()) {
            abr = self.ctx.store.update_typed(abr).await?;
        }
        Ok(abr)
    }

    /// Drops every contaminant whose own `ArtifactBuild` has completed.
    ///
    /// Outputs no longer carrying any outstanding contaminant count as
    /// deployed from then on. An empty list completes the build.
    async fn clear_contaminants(&self, db: &mut DependencyBuild) -> Result<()> {
        let key = db.key();
        for contaminant in db.status.contaminants.clone() {
            let rebuilt = self
                .ctx
                .store
                .find_typed::<ArtifactBuild>(&db.metadata.namespace, &artifact_build_name(&contaminant.gav))
                .await?;
            match rebuilt {
                Some(abr) if abr.status.state == ArtifactBuildState::Complete => {
                    db.status.remove_contaminant(&contaminant.gav);
                    promote_outputs(&mut db.status, &contaminant);
                    info!(dependency_build = %key.name, gav = %contaminant.gav, "contaminant cleared");
                    self.ctx
                        .record(ReconcileEvent::ContaminantCleared {
                            key: key.clone(),
                            gav: contaminant.gav,
                        })
                        .await;
                }
                _ => {
                    debug!(dependency_build = %key.name, gav = %contaminant.gav, "contaminant outstanding");
                    self.request_contaminant_rebuild(db, &contaminant.gav).await?;
                }
            }
        }

        if db.status.contaminants.is_empty() {
            db.status.state = DependencyBuildState::Complete;
        }
        Ok(())
    }

    async fn write_status(&self, before: &DependencyBuildStatus, next: DependencyBuild) -> Result<()> {
        if *before == next.status {
            return Ok(());
        }
        let key = next.key();
        let (from, to) = (before.state, next.status.state);
        self.ctx.store.update_status_typed(next).await?;
        if from != to {
            info!(dependency_build = %key.name, %from, %to, "dependency build state changed");
            self.ctx
                .record(ReconcileEvent::DependencyBuildStateChanged { key, from, to })
                .await;
        }
        Ok(())
    }
}

fn promote_outputs(status: &mut DependencyBuildStatus, cleared: &Contaminant) {
    for artifact in &cleared.contaminated_artifacts {
        if status.contaminated_by(artifact).is_none() && !status.deployed(artifact) {
            status.deployed_artifacts.push(artifact.clone());
        }
    }
}
