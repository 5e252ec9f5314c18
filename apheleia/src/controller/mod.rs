//! The control loop.
//!
//! Watch pumps turn store and pipeline notifications into reconcile keys, a
//! [`WorkQueue`] deduplicates them, and a fixed pool of workers drains the
//! queue through the [`Reconciler`]. Because reconciles are level-triggered,
//! a lagged watch only costs a resync.

mod backoff;
mod queue;

pub use backoff::{BackoffConfig, BackoffStrategy, JitterStrategy};
pub use queue::{QueueMetrics, WorkQueue};

use dashmap::DashSet;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::core::{Kind, ObjectKey, CONTAMINATED_BY_ANNOTATION_PREFIX};
use crate::errors::{ApheleiaError, Result};
use crate::pipeline::{PipelineBackend, RunEvent};
use crate::reconciler::{Context, ReconcileOutcome, Reconciler};
use crate::store::{LabelSelector, Object, ObjectStore, WatchEvent};

/// Keys to reconcile when `object` changes: the record itself plus every
/// record whose status is derived from it.
#[must_use]
pub fn keys_for_object(object: &Object) -> Vec<ObjectKey> {
    let key = object.key();
    let meta = object.metadata();
    let mut keys = vec![key.clone()];
    match object {
        Object::ComponentBuild(_) => {}
        Object::ArtifactBuild(abr) => {
            keys.extend(
                meta.owners_of_kind(Kind::ComponentBuild)
                    .into_iter()
                    .map(|name| key.sibling(Kind::ComponentBuild, name)),
            );
            keys.extend(
                meta.annotations
                    .iter()
                    .filter(|(k, _)| k.starts_with(CONTAMINATED_BY_ANNOTATION_PREFIX))
                    .map(|(_, db)| key.sibling(Kind::DependencyBuild, db.clone())),
            );
            if let Some(db) = abr.dependency_build_name() {
                keys.push(key.sibling(Kind::DependencyBuild, db));
            }
        }
        Object::DependencyBuild(_) => {
            keys.extend(
                meta.owners_of_kind(Kind::ArtifactBuild)
                    .into_iter()
                    .map(|name| key.sibling(Kind::ArtifactBuild, name)),
            );
        }
    }
    keys
}

/// The key to reconcile when a run changes: its owner.
#[must_use]
pub fn keys_for_run(event: &RunEvent) -> Vec<ObjectKey> {
    vec![event.status.owner.clone()]
}

/// Runs the reconcile loop.
#[derive(Clone)]
pub struct Controller {
    reconciler: Reconciler,
    store: Arc<dyn ObjectStore>,
    backend: Arc<dyn PipelineBackend>,
    queue: WorkQueue<ObjectKey>,
    config: Arc<ControllerConfig>,
    namespaces: Arc<DashSet<String>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.config.workers)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller over the collaborators in `ctx`.
    #[must_use]
    pub fn new(ctx: Context, config: Arc<ControllerConfig>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store: ctx.store.clone(),
            backend: Arc::clone(ctx.dispatcher.backend()),
            reconciler: Reconciler::new(ctx),
            queue: WorkQueue::new(config.requeue.clone()),
            config,
            namespaces: Arc::new(DashSet::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    /// The work queue.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Includes `namespace` in resyncs. Namespaces seen in watch events are
    /// included automatically.
    pub fn watch_namespace(&self, namespace: impl Into<String>) {
        self.namespaces.insert(namespace.into());
    }

    /// Queues `key` for reconciliation.
    pub fn enqueue(&self, key: ObjectKey) {
        if !self.namespaces.contains(&key.namespace) {
            self.namespaces.insert(key.namespace.clone());
        }
        self.queue.add(key);
    }

    /// Queues every stored record in every known namespace.
    pub async fn resync(&self) -> Result<usize> {
        let namespaces: Vec<String> = self.namespaces.iter().map(|ns| ns.clone()).collect();
        let selector = LabelSelector::everything();
        let mut listings: FuturesUnordered<_> = namespaces
            .iter()
            .flat_map(|ns| Kind::ALL.into_iter().map(move |kind| (ns, kind)))
            .map(|(ns, kind)| self.store.list(kind, ns, &selector))
            .collect();

        let mut queued = 0;
        while let Some(objects) = listings.next().await {
            for object in objects? {
                self.queue.add(object.key());
                queued += 1;
            }
        }
        debug!(queued, namespaces = namespaces.len(), "resync");
        Ok(queued)
    }

    /// Asks a running controller to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Runs until [`Controller::shutdown`] is called.
    ///
    /// Workers finish the reconcile they are in before returning.
    pub async fn run(&self) -> Result<()> {
        if self.config.workers == 0 {
            return Err(ApheleiaError::Config("workers must be at least 1".to_string()));
        }

        let mut pumps = JoinSet::new();
        pumps.spawn(self.clone().pump_store(self.store.watch()));
        pumps.spawn(self.clone().pump_runs(self.backend.watch()));
        self.resync().await?;

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            workers.spawn(self.clone().worker(id));
        }
        info!(workers = self.config.workers, "controller started");

        let mut stop = self.shutdown.subscribe();
        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                break;
            }
        }

        self.queue.shut_down();
        pumps.abort_all();
        while workers.join_next().await.is_some() {}
        info!("controller stopped");
        Ok(())
    }

    async fn pump_store(self, mut events: broadcast::Receiver<WatchEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    for key in keys_for_object(&event.object) {
                        self.enqueue(key);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "store watch lagged, resyncing");
                    if let Err(err) = self.resync().await {
                        error!(error = %err, "resync failed");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn pump_runs(self, mut events: broadcast::Receiver<RunEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    for key in keys_for_run(&event) {
                        self.enqueue(key);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "pipeline watch lagged, resyncing");
                    if let Err(err) = self.resync().await {
                        error!(error = %err, "resync failed");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn worker(self, id: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "worker stopped");
    }

    /// Reconciles `key` under the configured deadline and schedules any
    /// follow-up: a requeue the reconciler asked for, or a backoff retry
    /// after a transient failure.
    pub async fn process(&self, key: &ObjectKey) {
        let deadline = self.config.reconcile_timeout();
        let result = tokio::time::timeout(deadline, self.reconciler.reconcile(key))
            .await
            .unwrap_or_else(|_| {
                Err(ApheleiaError::Timeout {
                    key: key.clone(),
                    seconds: self.config.reconcile_timeout_seconds,
                })
            });

        match result {
            Ok(ReconcileOutcome::Done) => self.queue.forget(key),
            Ok(ReconcileOutcome::RequeueAfter(delay)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), delay);
            }
            Err(err) if err.is_retryable() => {
                let delay = self.queue.add_rate_limited(key.clone());
                let attempts = self.queue.num_requeues(key);
                if matches!(err, ApheleiaError::Conflict { .. }) {
                    debug!(key = %key, error = %err, "write conflict, retrying");
                } else {
                    warn!(key = %key, error = %err, attempts, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconcile failed, retrying");
                }
            }
            Err(err) => {
                error!(key = %key, code = err.code(), error = %err, "reconcile failed");
                self.queue.forget(key);
            }
        }
    }
}
