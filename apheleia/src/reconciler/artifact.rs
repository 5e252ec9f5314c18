//! `ArtifactBuild` state machine.
//!
//! New starts discovery, Discovering waits for it and joins (or creates) the
//! `DependencyBuild` for the discovered checkout, Building follows that
//! build. A Failed artifact whose failure was contamination heals once the
//! flagging build has deployed it.

use tracing::{debug, info, warn};

use super::{Context, ReconcileOutcome};
use crate::core::{
    ArtifactBuild, ArtifactBuildState, ArtifactBuildStatus, DependencyBuild, DependencyBuildState,
    Kind, OwnerReference, RebuildPhase, ScmInfo, REBUILD_ANNOTATION,
};
use crate::errors::{ApheleiaError, Result};
use crate::events::ReconcileEvent;
use crate::identity::contaminated_by_annotation;
use crate::pipeline::results::DiscoveryResult;
use crate::pipeline::PipelinePurpose;
use crate::store::{LabelSelector, Resource, TypedStore};

const JOIN_ATTEMPTS: usize = 3;

/// Reconciles `ArtifactBuild` records.
#[derive(Debug, Clone)]
pub struct ArtifactBuildReconciler {
    ctx: Context,
}

impl ArtifactBuildReconciler {
    /// Creates the reconciler.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Reconciles one `ArtifactBuild`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let Some(abr) = self
            .ctx
            .store
            .find_typed::<ArtifactBuild>(namespace, name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if abr.rebuild_requested() {
            self.consume_rebuild(abr).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let before = abr.status.clone();
        let mut next = abr;
        next.status.rebuild = RebuildPhase::Cleared;

        let next = match before.state {
            ArtifactBuildState::New => {
                self.start_discovery(&mut next).await?;
                next
            }
            ArtifactBuildState::Discovering => self.await_discovery(next).await?,
            ArtifactBuildState::Building => self.follow_dependency_build(next).await?,
            ArtifactBuildState::Failed => self.heal(next).await?,
            ArtifactBuildState::Complete | ArtifactBuildState::Missing => next,
        };

        self.write_status(&before, next).await?;
        Ok(ReconcileOutcome::Done)
    }

    async fn start_discovery(&self, abr: &mut ArtifactBuild) -> Result<()> {
        let key = abr.key();
        let dispatched = self
            .ctx
            .dispatcher
            .start_discovery(&key, &abr.spec.gav)
            .await?;
        self.ctx
            .record_dispatch(&key, PipelinePurpose::Discover, &dispatched)
            .await;

        abr.status.state = ArtifactBuildState::Discovering;
        abr.status.discovery_run = Some(dispatched.run);
        abr.status.scm_info = None;
        abr.status.message.clear();
        Ok(())
    }

    async fn await_discovery(&self, mut abr: ArtifactBuild) -> Result<ArtifactBuild> {
        let Some(run_ref) = abr.status.discovery_run.clone() else {
            self.start_discovery(&mut abr).await?;
            return Ok(abr);
        };
        let run = self.ctx.dispatcher.get_run(&run_ref).await?;
        if run.in_flight() {
            return Ok(abr);
        }

        let discovered = DiscoveryResult::from_run(&run);
        match discovered.scm_info {
            None => {
                abr.status.state = ArtifactBuildState::Missing;
                abr.status.message = discovered
                    .message
                    .unwrap_or_else(|| format!("source of {} could not be located", abr.spec.gav));
                info!(gav = %abr.spec.gav, run = %run_ref, "source not found");
            }
            Some(scm) => {
                self.join_dependency_build(&abr, &scm, &discovered.version)
                    .await?;
                abr.status.state = ArtifactBuildState::Building;
                abr.status.scm_info = Some(scm);
                abr.status.message.clear();
            }
        }
        Ok(abr)
    }

    /// Gets or creates the `DependencyBuild` for `scm` and makes `abr` one of
    /// its owners.
    async fn join_dependency_build(
        &self,
        abr: &ArtifactBuild,
        scm: &ScmInfo,
        version: &str,
    ) -> Result<DependencyBuild> {
        let owner = OwnerReference::to(Kind::ArtifactBuild, &abr.metadata, false)?;
        let mut candidate = DependencyBuild::new(abr.metadata.namespace.clone(), scm.clone(), version);
        candidate.metadata.add_owner(owner.clone());

        // A concurrent rebuild can delete the build between the read and the
        // owner write; the next attempt recreates it.
        for _ in 0..JOIN_ATTEMPTS {
            let (mut db, created) = self.ctx.store.get_or_create(candidate.clone()).await?;
            if created {
                info!(dependency_build = %db.metadata.name, scm_url = %scm.scm_url, tag = %scm.tag, "created dependency build");
                return Ok(db);
            }
            if !db.metadata.add_owner(owner.clone()) {
                return Ok(db);
            }
            debug!(dependency_build = %db.metadata.name, gav = %abr.spec.gav, "joining existing dependency build");
            match self.ctx.store.update_typed(db).await {
                Ok(db) => return Ok(db),
                Err(err) if err.is_not_found() => {
                    debug!(dependency_build = %candidate.metadata.name, "dependency build vanished while joining");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ApheleiaError::not_found(candidate.key()))
    }

    async fn follow_dependency_build(&self, mut abr: ArtifactBuild) -> Result<ArtifactBuild> {
        let Some(scm) = abr.status.scm_info.clone() else {
            return Err(ApheleiaError::invariant(format!(
                "{} is Building without source coordinates",
                abr.metadata.name
            )));
        };

        let existing = self
            .ctx
            .store
            .find_typed::<DependencyBuild>(&abr.metadata.namespace, &scm.dependency_build_id())
            .await?;
        let db = match existing {
            Some(db) if db.metadata.is_owned_by(abr.metadata.uid) => db,
            _ => {
                let version = self.discovered_version(&abr).await?;
                self.join_dependency_build(&abr, &scm, &version).await?
            }
        };

        let gav = abr.spec.gav.clone();
        match db.status.state {
            DependencyBuildState::Failed => {
                abr.status.state = ArtifactBuildState::Failed;
                abr.status.message = if db.status.message.is_empty() {
                    format!("dependency build {} failed", db.metadata.name)
                } else {
                    format!("dependency build {} failed: {}", db.metadata.name, db.status.message)
                };
            }
            DependencyBuildState::Contaminated => {
                if let Some(contaminant) = db.status.contaminated_by(&gav).map(ToString::to_string) {
                    let link = contaminated_by_annotation(&db.metadata.name);
                    if abr.metadata.set_annotation(link, db.metadata.name.clone()) {
                        abr = self.update_metadata(abr).await?;
                    }
                    warn!(%gav, %contaminant, dependency_build = %db.metadata.name, "output is contaminated");
                    abr.status.state = ArtifactBuildState::Failed;
                    abr.status.message = format!("contaminated by {contaminant}");
                }
            }
            DependencyBuildState::Complete => {
                if db.status.deployed(&gav) {
                    abr.status.state = ArtifactBuildState::Complete;
                    abr.status.message.clear();
                } else {
                    abr.status.state = ArtifactBuildState::Failed;
                    abr.status.message = format!(
                        "dependency build {} completed without deploying {gav}",
                        db.metadata.name
                    );
                }
            }
            DependencyBuildState::New | DependencyBuildState::Building => {}
        }
        Ok(abr)
    }

    /// Version reported by the artifact's discovery run, used when the
    /// `DependencyBuild` has to be re-created.
    async fn discovered_version(&self, abr: &ArtifactBuild) -> Result<String> {
        match &abr.status.discovery_run {
            Some(run) => {
                let run = self.ctx.dispatcher.get_run(run).await?;
                Ok(DiscoveryResult::from_run(&run).version)
            }
            None => Ok(String::new()),
        }
    }

    async fn heal(&self, mut abr: ArtifactBuild) -> Result<ArtifactBuild> {
        for (link, db_name) in abr.contaminated_by() {
            let Some(db) = self
                .ctx
                .store
                .find_typed::<DependencyBuild>(&abr.metadata.namespace, &db_name)
                .await?
            else {
                continue;
            };
            if db.status.state == DependencyBuildState::Complete && db.status.deployed(&abr.spec.gav) {
                abr.metadata.remove_annotation(&link);
                abr = self.update_metadata(abr).await?;
                abr.status.state = ArtifactBuildState::Complete;
                abr.status.message.clear();
                info!(gav = %abr.spec.gav, dependency_build = %db_name, "contamination resolved");
                break;
            }
        }
        Ok(abr)
    }

    /// Consumes a rebuild request in two passes.
    ///
    /// The first pass releases every `DependencyBuild` this artifact owns
    /// and persists a reset status marked `Pending`. The second removes the
    /// annotation and marks the phase `Consumed`. Normal processing resumes
    /// on the pass after that.
    async fn consume_rebuild(&self, abr: ArtifactBuild) -> Result<()> {
        let before = abr.status.clone();
        if before.rebuild == RebuildPhase::Pending {
            let mut next = abr;
            next.metadata.remove_annotation(REBUILD_ANNOTATION);
            let mut next = self.update_metadata(next).await?;
            next.status.rebuild = RebuildPhase::Consumed;
            self.write_status(&before, next).await?;
            return Ok(());
        }

        self.release_dependency_builds(&abr).await?;
        let key = abr.key();
        let mut next = abr;
        next.status = ArtifactBuildStatus {
            rebuild: RebuildPhase::Pending,
            ..ArtifactBuildStatus::default()
        };
        info!(gav = %next.spec.gav, "rebuild requested");
        self.ctx
            .record(ReconcileEvent::RebuildRequested { key })
            .await;
        self.write_status(&before, next).await?;
        Ok(())
    }

    async fn release_dependency_builds(&self, abr: &ArtifactBuild) -> Result<()> {
        let uid = abr.metadata.uid;
        let owned: Vec<DependencyBuild> = self
            .ctx
            .store
            .list_typed::<DependencyBuild>(&abr.metadata.namespace, &LabelSelector::everything())
            .await?
            .into_iter()
            .filter(|db| db.metadata.is_owned_by(uid))
            .collect();

        for mut db in owned {
            db.metadata.remove_owner(uid);
            let key = db.key();
            if db.metadata.owner_references.is_empty() {
                if self.ctx.store.delete_if_exists(&key).await? {
                    info!(dependency_build = %key.name, "deleted dependency build with no owners");
                    self.ctx
                        .record(ReconcileEvent::DependencyBuildDeleted { key })
                        .await;
                }
            } else {
                self.ctx.store.update_typed(db).await?;
            }
        }
        Ok(())
    }

    /// Writes metadata, keeping the in-memory status for the following
    /// status write.
    async fn update_metadata(&self, abr: ArtifactBuild) -> Result<ArtifactBuild> {
        let status = abr.status.clone();
        let mut stored = self.ctx.store.update_typed(abr).await?;
        stored.status = status;
        Ok(stored)
    }

    async fn write_status(&self, before: &ArtifactBuildStatus, next: ArtifactBuild) -> Result<()> {
        if *before == next.status {
            return Ok(());
        }
        let key = next.key();
        let (from, to) = (before.state, next.status.state);
        self.ctx.store.update_status_typed(next).await?;
        if from != to {
            info!(artifact_build = %key.name, %from, %to, "artifact build state changed");
            self.ctx
                .record(ReconcileEvent::ArtifactBuildStateChanged { key, from, to })
                .await;
        }
        Ok(())
    }
}
