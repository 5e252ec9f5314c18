//! In-memory [`PipelineBackend`]: runs are recorded on creation and finished
//! by the caller with [`InMemoryPipelineBackend::complete_run`].

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{
    PipelineBackend, PipelinePurpose, RunEvent, RunEventType, RunQuery, RunRef, RunRequest,
    RunStatus,
};
use crate::errors::{ApheleiaError, Result};

const WATCH_CAPACITY: usize = 1024;

/// In-memory pipeline backend.
#[derive(Debug, Clone)]
pub struct InMemoryPipelineBackend {
    runs: Arc<Mutex<Vec<RunStatus>>>,
    create_faults: Arc<Mutex<VecDeque<ApheleiaError>>>,
    events: broadcast::Sender<RunEvent>,
}

impl Default for InMemoryPipelineBackend {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            runs: Arc::new(Mutex::new(Vec::new())),
            create_faults: Arc::new(Mutex::new(VecDeque::new())),
            events,
        }
    }
}

impl InMemoryPipelineBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `create_run` fail with `err`.
    pub fn fail_next_create(&self, err: ApheleiaError) {
        self.create_faults.lock().push_back(err);
    }

    /// Every run, oldest first.
    #[must_use]
    pub fn runs(&self) -> Vec<RunStatus> {
        self.runs.lock().clone()
    }

    /// Runs of one purpose, oldest first.
    #[must_use]
    pub fn runs_for(&self, purpose: PipelinePurpose) -> Vec<RunStatus> {
        self.runs
            .lock()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }

    /// Runs not yet completed, oldest first.
    #[must_use]
    pub fn in_flight(&self) -> Vec<RunStatus> {
        self.runs
            .lock()
            .iter()
            .filter(|r| r.in_flight())
            .cloned()
            .collect()
    }

    /// Finishes a run with the given outcome and results.
    pub fn complete_run<K, V>(
        &self,
        run: &RunRef,
        succeeded: bool,
        results: impl IntoIterator<Item = (K, V)>,
    ) -> Result<RunStatus>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let status = {
            let mut runs = self.runs.lock();
            let status = runs
                .iter_mut()
                .find(|r| &r.run == run)
                .ok_or_else(|| ApheleiaError::Pipeline(format!("unknown run {run}")))?;
            if status.completed {
                return Err(ApheleiaError::Pipeline(format!("run {run} already completed")));
            }
            status.completed = true;
            status.succeeded = succeeded;
            status.completed_at = Some(Utc::now());
            status.results = results
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect::<BTreeMap<_, _>>();
            status.clone()
        };

        debug!(run = %run, succeeded, "run completed");
        let _ = self.events.send(RunEvent {
            event_type: RunEventType::Completed,
            status: status.clone(),
        });
        Ok(status)
    }
}

#[async_trait]
impl PipelineBackend for InMemoryPipelineBackend {
    async fn create_run(&self, request: RunRequest) -> Result<RunRef> {
        if let Some(err) = self.create_faults.lock().pop_front() {
            return Err(err);
        }

        let run = RunRef::new(format!(
            "{}-{}-{}",
            request.owner.name,
            request.purpose,
            Uuid::new_v4().simple()
        ));
        let status = RunStatus {
            run: run.clone(),
            purpose: request.purpose,
            owner: request.owner,
            subject: request.subject,
            task: request.task,
            params: request.params,
            completed: false,
            succeeded: false,
            results: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.runs.lock().push(status.clone());

        debug!(run = %run, purpose = %status.purpose, "run created");
        let _ = self.events.send(RunEvent {
            event_type: RunEventType::Created,
            status,
        });
        Ok(run)
    }

    async fn get_run(&self, run: &RunRef) -> Result<RunStatus> {
        self.runs
            .lock()
            .iter()
            .find(|r| &r.run == run)
            .cloned()
            .ok_or_else(|| ApheleiaError::Pipeline(format!("unknown run {run}")))
    }

    async fn find_runs(&self, query: &RunQuery) -> Result<Vec<RunStatus>> {
        Ok(self
            .runs
            .lock()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }
}
