//! Pipeline Dispatcher.
//!
//! Creates and looks up pipeline runs on behalf of the reconcilers. Runs are
//! identified by their labels (purpose, owner, subject) rather than by a
//! stored reference, so a reconcile that crashed between creating a run and
//! recording it finds the run again instead of starting a second one.

pub mod params;

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::core::{ComponentBuildState, ObjectKey, ScmInfo};
use crate::errors::Result;
use crate::pipeline::{PipelineBackend, PipelinePurpose, RunQuery, RunRef, RunRequest, RunStatus};

/// Result of [`Dispatcher::ensure_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// The in-flight run.
    pub run: RunRef,
    /// True if this call started it.
    pub created: bool,
}

/// Where a retried run (deploy or notify) stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunProgress {
    /// A run succeeded.
    Succeeded(RunRef),
    /// A run is executing.
    InFlight(RunRef),
    /// A new run was started by this call.
    Started(RunRef),
    /// The last attempt failed; the next may start after the delay.
    RetryAfter {
        /// The failed run.
        last: RunRef,
        /// Remaining wait.
        delay: Duration,
    },
    /// Every allowed attempt failed.
    Exhausted {
        /// The last failed run.
        last: RunRef,
        /// Attempts made.
        attempts: u32,
    },
}

/// Creates, finds and interprets pipeline runs.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn PipelineBackend>,
    config: Arc<ControllerConfig>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pipelines", &self.config.pipelines)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(backend: Arc<dyn PipelineBackend>, config: Arc<ControllerConfig>) -> Self {
        Self { backend, config }
    }

    /// The backend runs are created on.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn PipelineBackend> {
        &self.backend
    }

    /// The controller configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The task name used for `purpose`.
    #[must_use]
    pub fn task_for(&self, purpose: PipelinePurpose) -> &str {
        let names = &self.config.pipelines;
        match purpose {
            PipelinePurpose::Discover => &names.discover_task,
            PipelinePurpose::Build => &names.build_task,
            PipelinePurpose::Deploy => &names.deploy_task,
            PipelinePurpose::Notify => &names.notify_task,
        }
    }

    /// Reads a run.
    pub async fn get_run(&self, run: &RunRef) -> Result<RunStatus> {
        self.backend.get_run(run).await
    }

    /// Returns the in-flight run for `(purpose, owner, subject)`, starting
    /// one with `params` if there is none.
    pub async fn ensure_run(
        &self,
        purpose: PipelinePurpose,
        owner: &ObjectKey,
        subject: Option<&str>,
        params: BTreeMap<String, String>,
    ) -> Result<Dispatched> {
        let query = RunQuery::new(purpose, owner.clone(), subject.map(ToString::to_string));
        let runs = self.backend.find_runs(&query).await?;
        if let Some(existing) = runs.into_iter().find(RunStatus::in_flight) {
            debug!(run = %existing.run, %purpose, owner = %owner, "joining in-flight run");
            return Ok(Dispatched {
                run: existing.run,
                created: false,
            });
        }
        let run = self.create(query, params).await?;
        Ok(Dispatched { run, created: true })
    }

    /// The most recently created run for `(purpose, owner, subject)`.
    pub async fn latest_run(
        &self,
        purpose: PipelinePurpose,
        owner: &ObjectKey,
        subject: Option<&str>,
    ) -> Result<Option<RunStatus>> {
        let query = RunQuery::new(purpose, owner.clone(), subject.map(ToString::to_string));
        let runs = self.backend.find_runs(&query).await?;
        Ok(runs.into_iter().max_by_key(|r| r.created_at))
    }

    /// Number of completed, unsuccessful runs for `(purpose, owner, subject)`.
    pub async fn failed_attempts(
        &self,
        purpose: PipelinePurpose,
        owner: &ObjectKey,
        subject: Option<&str>,
    ) -> Result<u32> {
        let query = RunQuery::new(purpose, owner.clone(), subject.map(ToString::to_string));
        let runs = self.backend.find_runs(&query).await?;
        Ok(u32::try_from(runs.iter().filter(|r| r.failed()).count()).unwrap_or(u32::MAX))
    }

    /// Starts (or joins) the discovery run for an artifact.
    pub async fn start_discovery(&self, owner: &ObjectKey, gav: &str) -> Result<Dispatched> {
        self.ensure_run(PipelinePurpose::Discover, owner, None, params::discovery(gav))
            .await
    }

    /// Starts (or joins) the build run for a repository checkout.
    pub async fn start_build(
        &self,
        owner: &ObjectKey,
        scm: &ScmInfo,
        version: &str,
    ) -> Result<Dispatched> {
        let params = params::build(scm, version, &self.config.pipelines.builder_image);
        self.ensure_run(PipelinePurpose::Build, owner, None, params).await
    }

    /// Drives the deploy run of one artifact of a component round.
    pub async fn deploy(&self, owner: &ObjectKey, round: u32, gav: &str) -> Result<RunProgress> {
        let subject = format!("{round}:{gav}");
        let params = params::deploy(gav, &self.config.deploy);
        self.drive(PipelinePurpose::Deploy, owner, &subject, params).await
    }

    /// Drives the notify run of a component round.
    pub async fn notify(
        &self,
        owner: &ObjectKey,
        round: u32,
        state: ComponentBuildState,
        message: &str,
        pr_url: &str,
    ) -> Result<RunProgress> {
        let params = params::notify(&owner.name, state, message, pr_url, &self.config.notify);
        self.drive(PipelinePurpose::Notify, owner, &round.to_string(), params)
            .await
    }

    /// Runs a purpose to success, retrying failed runs after a backoff
    /// measured from the failed run's completion.
    async fn drive(
        &self,
        purpose: PipelinePurpose,
        owner: &ObjectKey,
        subject: &str,
        params: BTreeMap<String, String>,
    ) -> Result<RunProgress> {
        let query = RunQuery::new(purpose, owner.clone(), Some(subject.to_string()));
        let runs = self.backend.find_runs(&query).await?;

        if let Some(done) = runs.iter().find(|r| r.completed && r.succeeded) {
            return Ok(RunProgress::Succeeded(done.run.clone()));
        }
        if let Some(running) = runs.iter().find(|r| r.in_flight()) {
            return Ok(RunProgress::InFlight(running.run.clone()));
        }

        let failures: Vec<&RunStatus> = runs.iter().filter(|r| r.failed()).collect();
        let Some(last) = failures.iter().max_by_key(|r| r.completed_at) else {
            let run = self.create(query, params).await?;
            return Ok(RunProgress::Started(run));
        };

        let retry = &self.config.pipeline_retry;
        let attempts = u32::try_from(failures.len()).unwrap_or(u32::MAX);
        if attempts >= retry.max_attempts {
            return Ok(RunProgress::Exhausted {
                last: last.run.clone(),
                attempts,
            });
        }

        let wait = retry.backoff.ceiling(attempts - 1);
        let elapsed = last
            .completed_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or(wait);
        if elapsed < wait {
            return Ok(RunProgress::RetryAfter {
                last: last.run.clone(),
                delay: wait - elapsed,
            });
        }

        info!(%purpose, owner = %owner, subject, attempts, "retrying failed run");
        let run = self.create(query, params).await?;
        Ok(RunProgress::Started(run))
    }

    async fn create(&self, query: RunQuery, params: BTreeMap<String, String>) -> Result<RunRef> {
        let request = RunRequest {
            purpose: query.purpose,
            task: self.task_for(query.purpose).to_string(),
            owner: query.owner,
            subject: query.subject,
            params,
        };
        let purpose = request.purpose;
        let owner = request.owner.clone();
        let run = self.backend.create_run(request).await?;
        info!(run = %run, %purpose, owner = %owner, "created pipeline run");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeployConfig, PipelineRetryConfig};
    use crate::controller::{BackoffConfig, JitterStrategy};
    use crate::core::Kind;
    use crate::errors::ApheleiaError;
    use crate::pipeline::{InMemoryPipelineBackend, MockPipelineBackend};

    fn config(backoff_ms: u64, max_attempts: u32) -> Arc<ControllerConfig> {
        Arc::new(
            ControllerConfig::default()
                .with_deploy(DeployConfig::new("https://repo"))
                .with_pipeline_retry(
                    PipelineRetryConfig::default()
                        .with_max_attempts(max_attempts)
                        .with_backoff(
                            BackoffConfig::new()
                                .with_base_delay_ms(backoff_ms)
                                .with_jitter(JitterStrategy::None),
                        ),
                ),
        )
    }

    fn owner() -> ObjectKey {
        ObjectKey::new(Kind::ComponentBuild, "ns", "cb")
    }

    fn in_flight(run: &str) -> RunStatus {
        RunStatus {
            run: RunRef::new(run),
            purpose: PipelinePurpose::Build,
            owner: ObjectKey::new(Kind::DependencyBuild, "ns", "db"),
            subject: None,
            task: "apheleia-build".to_string(),
            params: BTreeMap::new(),
            completed: false,
            succeeded: false,
            results: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_run_joins_in_flight_run() {
        let mut backend = MockPipelineBackend::new();
        backend
            .expect_find_runs()
            .times(1)
            .returning(|_| Ok(vec![in_flight("db-build-1")]));
        backend.expect_create_run().never();

        let dispatcher = Dispatcher::new(Arc::new(backend), config(0, 5));
        let scm = ScmInfo::git("https://example.com/r.git", "v1", "");
        let owner = ObjectKey::new(Kind::DependencyBuild, "ns", "db");
        let dispatched = dispatcher.start_build(&owner, &scm, "1.0").await.unwrap();

        assert_eq!(dispatched.run, RunRef::new("db-build-1"));
        assert!(!dispatched.created);
    }

    #[tokio::test]
    async fn test_ensure_run_creates_with_task_and_params() {
        let mut backend = MockPipelineBackend::new();
        backend.expect_find_runs().returning(|_| Ok(Vec::new()));
        backend
            .expect_create_run()
            .withf(|req| {
                req.purpose == PipelinePurpose::Discover
                    && req.task == "apheleia-discover"
                    && req.params.get("GAV").map(String::as_str) == Some("g:a:1")
                    && req.subject.is_none()
            })
            .times(1)
            .returning(|_| Ok(RunRef::new("a-discover-1")));

        let dispatcher = Dispatcher::new(Arc::new(backend), config(0, 5));
        let owner = ObjectKey::new(Kind::ArtifactBuild, "ns", "a");
        let dispatched = dispatcher.start_discovery(&owner, "g:a:1").await.unwrap();
        assert!(dispatched.created);
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let mut backend = MockPipelineBackend::new();
        backend
            .expect_find_runs()
            .returning(|_| Err(ApheleiaError::Unavailable("backend down".to_string())));

        let dispatcher = Dispatcher::new(Arc::new(backend), config(0, 5));
        let err = dispatcher.start_discovery(&owner(), "g:a:1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_deploy_progress_through_success() {
        let backend = Arc::new(InMemoryPipelineBackend::new());
        let dispatcher = Dispatcher::new(backend.clone(), config(0, 5));

        let RunProgress::Started(run) = dispatcher.deploy(&owner(), 0, "g:a:1").await.unwrap() else {
            panic!("expected a new deploy run");
        };
        assert_eq!(
            dispatcher.deploy(&owner(), 0, "g:a:1").await.unwrap(),
            RunProgress::InFlight(run.clone())
        );

        backend
            .complete_run(&run, true, Vec::<(String, String)>::new())
            .unwrap();
        assert_eq!(
            dispatcher.deploy(&owner(), 0, "g:a:1").await.unwrap(),
            RunProgress::Succeeded(run)
        );

        let latest = dispatcher
            .latest_run(PipelinePurpose::Deploy, &owner(), Some("0:g:a:1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.params["REPO"], "https://repo");
    }

    #[tokio::test]
    async fn test_failed_runs_retry_until_exhausted() {
        let backend = Arc::new(InMemoryPipelineBackend::new());
        let dispatcher = Dispatcher::new(backend.clone(), config(0, 2));

        for _ in 0..2 {
            let RunProgress::Started(run) = dispatcher.deploy(&owner(), 0, "g:a:1").await.unwrap()
            else {
                panic!("expected a new deploy run");
            };
            backend
                .complete_run(&run, false, Vec::<(String, String)>::new())
                .unwrap();
        }

        let progress = dispatcher.deploy(&owner(), 0, "g:a:1").await.unwrap();
        assert!(matches!(progress, RunProgress::Exhausted { attempts: 2, .. }));
        assert_eq!(
            dispatcher
                .failed_attempts(PipelinePurpose::Deploy, &owner(), Some("0:g:a:1"))
                .await
                .unwrap(),
            2
        );

        // A new round starts over.
        assert!(matches!(
            dispatcher.deploy(&owner(), 1, "g:a:1").await.unwrap(),
            RunProgress::Started(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_run_waits_for_backoff() {
        let backend = Arc::new(InMemoryPipelineBackend::new());
        let dispatcher = Dispatcher::new(backend.clone(), config(60_000, 5));

        let RunProgress::Started(run) = dispatcher
            .notify(&owner(), 0, ComponentBuildState::Complete, "done", "")
            .await
            .unwrap()
        else {
            panic!("expected a new notify run");
        };
        backend
            .complete_run(&run, false, Vec::<(String, String)>::new())
            .unwrap();

        let progress = dispatcher
            .notify(&owner(), 0, ComponentBuildState::Complete, "done", "")
            .await
            .unwrap();
        match progress {
            RunProgress::RetryAfter { last, delay } => {
                assert_eq!(last, run);
                assert!(delay > Duration::from_secs(50));
                assert!(delay <= Duration::from_secs(60));
            }
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }
}
