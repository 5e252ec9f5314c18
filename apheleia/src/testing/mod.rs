//! Test harness over the in-memory store and pipeline backend.
//!
//! The harness plays the part of the outside world: it creates records the
//! way a user would, finishes pipeline runs the way the build cluster would,
//! and drives reconciles by hand. Every helper panics on failure.

use std::sync::Arc;

use crate::config::{ControllerConfig, DeployConfig, PipelineRetryConfig};
use crate::controller::{BackoffConfig, JitterStrategy};
use crate::core::{
    ArtifactBuild, ArtifactBuildStatus, ComponentBuild, DependencyBuild, DependencyBuildStatus,
    Gav, Kind, ObjectKey, ScmInfo, REBUILD_ANNOTATION,
};
use crate::dispatch::Dispatcher;
use crate::errors::Result;
use crate::events::CollectingEventRecorder;
use crate::identity::artifact_build_name;
use crate::pipeline::{results, InMemoryPipelineBackend, PipelinePurpose, RunStatus};
use crate::reconciler::{Context, ReconcileOutcome, Reconciler};
use crate::store::{InMemoryStore, LabelSelector, TypedStore};

/// Namespace every harness record lives in.
pub const TEST_NAMESPACE: &str = "test";

const MAX_SETTLE_PASSES: usize = 100;

fn must<T>(result: Result<T>, what: &str) -> T {
    result.unwrap_or_else(|err| panic!("{what}: {err}"))
}

/// Wires a [`Reconciler`] to in-memory collaborators.
#[derive(Debug, Clone)]
pub struct Harness {
    /// The store.
    pub store: Arc<InMemoryStore>,
    /// The pipeline backend.
    pub backend: Arc<InMemoryPipelineBackend>,
    /// Every event the reconcilers emitted.
    pub events: Arc<CollectingEventRecorder>,
    /// The reconciler under test.
    pub reconciler: Reconciler,
    /// The configuration in use.
    pub config: Arc<ControllerConfig>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// A harness with default settings and a test deploy repository.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default().with_deploy(DeployConfig::new("https://repo.test")))
    }

    /// A harness whose deploy and notify runs retry `max_attempts` times,
    /// waiting `backoff_ms` between attempts.
    #[must_use]
    pub fn with_retry(max_attempts: u32, backoff_ms: u64) -> Self {
        let retry = PipelineRetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_backoff(
                BackoffConfig::new()
                    .with_base_delay_ms(backoff_ms)
                    .with_jitter(JitterStrategy::None),
            );
        Self::with_config(
            ControllerConfig::default()
                .with_deploy(DeployConfig::new("https://repo.test"))
                .with_pipeline_retry(retry),
        )
    }

    /// A harness using `config`.
    #[must_use]
    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(InMemoryPipelineBackend::new());
        let events = Arc::new(CollectingEventRecorder::new());
        let config = Arc::new(config);
        let dispatcher = Dispatcher::new(backend.clone(), config.clone());
        let reconciler = Reconciler::new(Context::new(store.clone(), dispatcher, events.clone()));
        Self {
            store,
            backend,
            events,
            reconciler,
            config,
        }
    }

    /// The reconcile context, for wiring a controller to the same world.
    #[must_use]
    pub fn context(&self) -> Context {
        Context::new(
            self.store.clone(),
            Dispatcher::new(self.backend.clone(), self.config.clone()),
            self.events.clone(),
        )
    }

    /// Reconciles one key.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        self.reconciler.reconcile(key).await
    }

    /// Reconciles every stored record until a full pass changes nothing.
    ///
    /// Returns the number of passes taken.
    pub async fn settle(&self) -> usize {
        for pass in 1..=MAX_SETTLE_PASSES {
            let before = self.fingerprint();
            for kind in Kind::ALL {
                for key in self.store.keys(kind) {
                    must(self.reconcile(&key).await, &format!("reconcile {key}"));
                }
            }
            if self.fingerprint() == before {
                return pass;
            }
        }
        panic!("records did not settle after {MAX_SETTLE_PASSES} passes");
    }

    fn fingerprint(&self) -> (u64, usize, usize, usize) {
        let runs = self.backend.runs();
        let completed = runs.iter().filter(|r| r.completed).count();
        (self.store.last_version(), self.store.len(), runs.len(), completed)
    }

    /// Stores a `ComponentBuild` requesting `artifacts`.
    pub async fn create_component(&self, name: &str, artifacts: &[&str]) -> ComponentBuild {
        let cb = ComponentBuild::new(TEST_NAMESPACE, name, artifacts.iter().copied());
        must(self.store.create_typed(cb).await, "create component build")
    }

    /// Stores an unowned `ArtifactBuild`.
    pub async fn create_artifact(&self, gav: &str) -> ArtifactBuild {
        must(
            self.store.create_typed(ArtifactBuild::new(TEST_NAMESPACE, gav)).await,
            "create artifact build",
        )
    }

    /// Reads a `ComponentBuild`.
    pub async fn component(&self, name: &str) -> ComponentBuild {
        must(self.store.get_typed(TEST_NAMESPACE, name).await, "get component build")
    }

    /// Reads the `ArtifactBuild` for `gav`.
    pub async fn artifact(&self, gav: &str) -> ArtifactBuild {
        must(
            self.store.get_typed(TEST_NAMESPACE, &artifact_build_name(gav)).await,
            "get artifact build",
        )
    }

    /// Reads the `ArtifactBuild` for `gav`, if any.
    pub async fn find_artifact(&self, gav: &str) -> Option<ArtifactBuild> {
        must(
            self.store.find_typed(TEST_NAMESPACE, &artifact_build_name(gav)).await,
            "find artifact build",
        )
    }

    /// Every `ArtifactBuild`.
    pub async fn artifact_builds(&self) -> Vec<ArtifactBuild> {
        must(
            self.store.list_typed(TEST_NAMESPACE, &LabelSelector::everything()).await,
            "list artifact builds",
        )
    }

    /// Reads a `DependencyBuild`.
    pub async fn dependency_build(&self, name: &str) -> DependencyBuild {
        must(self.store.get_typed(TEST_NAMESPACE, name).await, "get dependency build")
    }

    /// Reads a `DependencyBuild`, if any.
    pub async fn find_dependency_build(&self, name: &str) -> Option<DependencyBuild> {
        must(self.store.find_typed(TEST_NAMESPACE, name).await, "find dependency build")
    }

    /// Every `DependencyBuild`.
    pub async fn dependency_builds(&self) -> Vec<DependencyBuild> {
        must(
            self.store.list_typed(TEST_NAMESPACE, &LabelSelector::everything()).await,
            "list dependency builds",
        )
    }

    /// Overwrites the status of the `ArtifactBuild` for `gav`.
    pub async fn set_artifact_status(&self, gav: &str, status: ArtifactBuildStatus) {
        let mut abr = self.artifact(gav).await;
        abr.status = status;
        must(self.store.update_status_typed(abr).await, "set artifact status");
    }

    /// Overwrites the status of a `DependencyBuild`.
    pub async fn set_dependency_build_status(&self, name: &str, status: DependencyBuildStatus) {
        let mut db = self.dependency_build(name).await;
        db.status = status;
        must(self.store.update_status_typed(db).await, "set dependency build status");
    }

    /// Sets the rebuild annotation on the `ArtifactBuild` for `gav`.
    pub async fn request_rebuild(&self, gav: &str) {
        let mut abr = self.artifact(gav).await;
        abr.metadata.set_annotation(REBUILD_ANNOTATION, "true");
        must(self.store.update_typed(abr).await, "request rebuild");
    }

    /// Git coordinates for a repository called `name`.
    #[must_use]
    pub fn scm(&self, name: &str) -> ScmInfo {
        ScmInfo::git(format!("https://git.test/{name}.git"), "v1", "")
    }

    /// Finishes the in-flight discovery run for `gav` as having found `scm`.
    /// The reported version is the GAV's own.
    pub fn complete_discovery(&self, gav: &str, scm: &ScmInfo) {
        let run = self.in_flight_discovery(gav);
        let version = Gav::parse(gav).map(|g| g.version).unwrap_or_default();
        must(
            self.backend.complete_run(
                &run.run,
                true,
                [
                    (results::SCM_URL, scm.scm_url.clone()),
                    (results::SCM_TAG, scm.tag.clone()),
                    (results::SCM_TYPE, scm.scm_type.clone()),
                    (results::CONTEXT_PATH, scm.path.clone()),
                    (results::VERSION, version),
                ],
            ),
            "complete discovery",
        );
    }

    /// Finishes the in-flight discovery run for `gav` without coordinates.
    pub fn complete_discovery_missing(&self, gav: &str) {
        let run = self.in_flight_discovery(gav);
        must(
            self.backend
                .complete_run(&run.run, true, Vec::<(String, String)>::new()),
            "complete discovery",
        );
    }

    fn in_flight_discovery(&self, gav: &str) -> RunStatus {
        self.backend
            .in_flight()
            .into_iter()
            .find(|r| {
                r.purpose == PipelinePurpose::Discover
                    && r.params.get("GAV").map(String::as_str) == Some(gav)
            })
            .unwrap_or_else(|| panic!("no discovery run in flight for {gav}"))
    }

    /// Finishes the in-flight build run of a `DependencyBuild`.
    ///
    /// `contaminants` is the raw `CONTAMINANTS` result; empty means none.
    pub fn complete_build(&self, db_name: &str, deployed: &[&str], contaminants: &str) {
        let run = self
            .backend
            .in_flight()
            .into_iter()
            .find(|r| r.purpose == PipelinePurpose::Build && r.owner.name == db_name)
            .unwrap_or_else(|| panic!("no build run in flight for {db_name}"));

        let mut outputs = vec![(results::DEPLOYED_ARTIFACTS, deployed.join(","))];
        if !contaminants.is_empty() {
            outputs.push((results::CONTAMINANTS, contaminants.to_string()));
        }
        must(self.backend.complete_run(&run.run, true, outputs), "complete build");
    }

    /// Finishes every in-flight run of `purpose`. Returns how many.
    pub fn complete_all(&self, purpose: PipelinePurpose, succeeded: bool) -> usize {
        let runs: Vec<RunStatus> = self
            .backend
            .in_flight()
            .into_iter()
            .filter(|r| r.purpose == purpose)
            .collect();
        for run in &runs {
            must(
                self.backend
                    .complete_run(&run.run, succeeded, Vec::<(String, String)>::new()),
                "complete run",
            );
        }
        runs.len()
    }
}
