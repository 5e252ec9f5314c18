//! In-memory [`ObjectStore`] with optimistic concurrency, owner-reference
//! garbage collection, a broadcast watch and fault injection.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{LabelSelector, Object, ObjectStore, WatchEvent, WatchEventType};
use crate::core::{Kind, ObjectKey};
use crate::errors::{ApheleiaError, Result};

const WATCH_CAPACITY: usize = 1024;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `get`.
    Get,
    /// `list`.
    List,
    /// `create`.
    Create,
    /// `update`.
    Update,
    /// `update_status`.
    UpdateStatus,
    /// `delete`.
    Delete,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Object>,
    last_version: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// In-memory object store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
    faults: Arc<Mutex<HashMap<StoreOp, VecDeque<ApheleiaError>>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            faults: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: StoreOp, err: ApheleiaError) {
        self.faults.lock().entry(op).or_default().push_back(err);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }

    /// Keys of every stored record of `kind`, in key order.
    #[must_use]
    pub fn keys(&self, kind: Kind) -> Vec<ObjectKey> {
        self.inner
            .lock()
            .objects
            .keys()
            .filter(|k| k.kind == kind)
            .cloned()
            .collect()
    }

    /// The highest resource version handed out so far.
    #[must_use]
    pub fn last_version(&self) -> u64 {
        self.inner.lock().last_version
    }

    fn injected(&self, op: StoreOp) -> Result<()> {
        match self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn emit(&self, event_type: WatchEventType, object: Object) {
        // No receivers is not an error.
        let _ = self.events.send(WatchEvent { event_type, object });
    }

    fn write(&self, mut object: Object, status_only: bool) -> Result<Object> {
        let key = object.key();
        let mut inner = self.inner.lock();
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| ApheleiaError::not_found(key.clone()))?;

        let expected = object.metadata().resource_version;
        let actual = current.metadata().resource_version;
        if expected != actual {
            return Err(ApheleiaError::Conflict {
                key,
                expected,
                actual,
            });
        }

        if status_only {
            object.keep_spec_of(current)?;
        } else {
            object.keep_status_of(current)?;
            let meta = object.metadata_mut();
            meta.uid = current.metadata().uid;
            meta.creation_timestamp = current.metadata().creation_timestamp;
        }

        if &object == current {
            return Ok(object);
        }

        object.metadata_mut().resource_version = inner.next_version();
        inner.objects.insert(key, object.clone());
        drop(inner);

        self.emit(WatchEventType::Modified, object.clone());
        Ok(object)
    }

    /// Removes `key` and collects dependents, returning every removed record
    /// and every record modified by losing an owner reference.
    fn remove_cascading(inner: &mut Inner, key: &ObjectKey) -> (Vec<Object>, Vec<Object>) {
        let mut deleted = Vec::new();
        let mut modified: BTreeMap<ObjectKey, Object> = BTreeMap::new();
        let mut pending = vec![key.clone()];

        while let Some(next) = pending.pop() {
            let Some(removed) = inner.objects.remove(&next) else {
                continue;
            };
            modified.remove(&next);
            let uid = removed.metadata().uid;
            deleted.push(removed);

            let dependents: Vec<ObjectKey> = inner
                .objects
                .iter()
                .filter(|(_, o)| o.metadata().is_owned_by(uid))
                .map(|(k, _)| k.clone())
                .collect();

            for dependent in dependents {
                let version = inner.next_version();
                let Some(object) = inner.objects.get_mut(&dependent) else {
                    continue;
                };
                let meta = object.metadata_mut();
                meta.remove_owner(uid);
                meta.resource_version = version;
                if meta.owner_references.is_empty() {
                    pending.push(dependent);
                } else {
                    modified.insert(dependent, object.clone());
                }
            }
        }

        (deleted, modified.into_values().collect())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Object> {
        self.injected(StoreOp::Get)?;
        self.inner
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ApheleiaError::not_found(key.clone()))
    }

    async fn list(
        &self,
        kind: Kind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Object>> {
        self.injected(StoreOp::List)?;
        Ok(self
            .inner
            .lock()
            .objects
            .iter()
            .filter(|(k, o)| {
                k.kind == kind && k.namespace == namespace && selector.matches(&o.metadata().labels)
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, mut object: Object) -> Result<Object> {
        self.injected(StoreOp::Create)?;
        let key = object.key();
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&key) {
            return Err(ApheleiaError::AlreadyExists { key });
        }

        let version = inner.next_version();
        let meta = object.metadata_mut();
        meta.uid = Uuid::new_v4();
        meta.creation_timestamp = Some(Utc::now());
        meta.resource_version = version;
        inner.objects.insert(key.clone(), object.clone());
        drop(inner);

        debug!(key = %key, version, "created");
        self.emit(WatchEventType::Added, object.clone());
        Ok(object)
    }

    async fn update(&self, object: Object) -> Result<Object> {
        self.injected(StoreOp::Update)?;
        self.write(object, false)
    }

    async fn update_status(&self, object: Object) -> Result<Object> {
        self.injected(StoreOp::UpdateStatus)?;
        self.write(object, true)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.injected(StoreOp::Delete)?;
        let (deleted, modified) = {
            let mut inner = self.inner.lock();
            if !inner.objects.contains_key(key) {
                return Err(ApheleiaError::not_found(key.clone()));
            }
            Self::remove_cascading(&mut inner, key)
        };

        debug!(key = %key, collected = deleted.len() - 1, "deleted");
        for object in modified {
            self.emit(WatchEventType::Modified, object);
        }
        for object in deleted {
            self.emit(WatchEventType::Deleted, object);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
