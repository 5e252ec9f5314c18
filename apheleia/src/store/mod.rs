//! Persistent object store port.
//!
//! The engine only ever talks to the store through [`ObjectStore`]: get, list
//! by label selector, create, update (metadata and spec), update the status
//! sub-resource, delete, and a watch stream. Every write is checked against
//! the `resource_version` the caller read, so cross-record coordination is a
//! read-modify-write cycle with conflicts surfacing as
//! [`ApheleiaError::Conflict`].

mod memory;

pub use memory::{InMemoryStore, StoreOp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::core::{ArtifactBuild, ComponentBuild, DependencyBuild, Kind, ObjectKey, ObjectMeta};
use crate::errors::{ApheleiaError, Result};

/// Any record the store holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Object {
    /// A component request.
    ComponentBuild(ComponentBuild),
    /// An artifact build.
    ArtifactBuild(ArtifactBuild),
    /// A repository build.
    DependencyBuild(DependencyBuild),
}

macro_rules! each_object {
    ($object:expr, $inner:ident => $body:expr) => {
        match $object {
            Object::ComponentBuild($inner) => $body,
            Object::ArtifactBuild($inner) => $body,
            Object::DependencyBuild($inner) => $body,
        }
    };
}

impl Object {
    /// The record kind.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::ComponentBuild(_) => Kind::ComponentBuild,
            Self::ArtifactBuild(_) => Kind::ArtifactBuild,
            Self::DependencyBuild(_) => Kind::DependencyBuild,
        }
    }

    /// The record metadata.
    #[must_use]
    pub fn metadata(&self) -> &ObjectMeta {
        each_object!(self, o => &o.metadata)
    }

    /// Mutable record metadata.
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        each_object!(self, o => &mut o.metadata)
    }

    /// The record key.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(self.kind(), meta.namespace.clone(), meta.name.clone())
    }

    /// Copies `current`'s status into `self`, for metadata/spec updates.
    pub(crate) fn keep_status_of(&mut self, current: &Self) -> Result<()> {
        match (self, current) {
            (Self::ComponentBuild(new), Self::ComponentBuild(cur)) => new.status = cur.status.clone(),
            (Self::ArtifactBuild(new), Self::ArtifactBuild(cur)) => new.status = cur.status.clone(),
            (Self::DependencyBuild(new), Self::DependencyBuild(cur)) => {
                new.status = cur.status.clone();
            }
            (new, cur) => return Err(kind_mismatch(new.kind(), cur.kind())),
        }
        Ok(())
    }

    /// Copies `current`'s metadata and spec into `self`, for status updates.
    pub(crate) fn keep_spec_of(&mut self, current: &Self) -> Result<()> {
        match (self, current) {
            (Self::ComponentBuild(new), Self::ComponentBuild(cur)) => {
                new.metadata = cur.metadata.clone();
                new.spec = cur.spec.clone();
            }
            (Self::ArtifactBuild(new), Self::ArtifactBuild(cur)) => {
                new.metadata = cur.metadata.clone();
                new.spec = cur.spec.clone();
            }
            (Self::DependencyBuild(new), Self::DependencyBuild(cur)) => {
                new.metadata = cur.metadata.clone();
                new.spec = cur.spec.clone();
            }
            (new, cur) => return Err(kind_mismatch(new.kind(), cur.kind())),
        }
        Ok(())
    }
}

fn kind_mismatch(new: Kind, current: Kind) -> ApheleiaError {
    ApheleiaError::invariant(format!("cannot write a {new} over a stored {current}"))
}

/// A typed record the store can hold.
pub trait Resource: Clone + Send + Sync + 'static {
    /// The kind of this record type.
    const KIND: Kind;

    /// The record metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Mutable record metadata.
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Wraps the record.
    fn into_object(self) -> Object;

    /// Unwraps a record of this kind.
    fn from_object(object: Object) -> Option<Self>;

    /// The record key.
    fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(Self::KIND, meta.namespace.clone(), meta.name.clone())
    }
}

macro_rules! impl_resource {
    ($ty:ident) => {
        impl Resource for $ty {
            const KIND: Kind = Kind::$ty;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn into_object(self) -> Object {
                Object::$ty(self)
            }

            fn from_object(object: Object) -> Option<Self> {
                match object {
                    Object::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_resource!(ComponentBuild);
impl_resource!(ArtifactBuild);
impl_resource!(DependencyBuild);

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    required: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Matches every record.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Adds a required `key=value` pair.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.insert(key.into(), value.into());
        self
    }

    /// Returns true if every required pair is present in `labels`.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Type of a watch notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    /// The record was created.
    Added,
    /// The record was changed.
    Modified,
    /// The record was removed.
    Deleted,
}

/// A change notification. Delivery is at-least-once and may coalesce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub event_type: WatchEventType,
    /// The record after the change (before it, for deletions).
    pub object: Object,
}

/// The persistent object store the engine reconciles against.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads one record.
    async fn get(&self, key: &ObjectKey) -> Result<Object>;

    /// Lists the records of `kind` in `namespace` matching `selector`.
    async fn list(&self, kind: Kind, namespace: &str, selector: &LabelSelector)
        -> Result<Vec<Object>>;

    /// Creates a record, assigning uid, creation time and resource version.
    async fn create(&self, object: Object) -> Result<Object>;

    /// Replaces metadata and spec; the stored status is kept.
    async fn update(&self, object: Object) -> Result<Object>;

    /// Replaces the status; stored metadata and spec are kept.
    async fn update_status(&self, object: Object) -> Result<Object>;

    /// Deletes a record and garbage-collects dependents left without owners.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Subscribes to change notifications for every kind.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Typed helpers over any [`ObjectStore`].
#[async_trait]
pub trait TypedStore: ObjectStore {
    /// Reads a record of type `R`.
    async fn get_typed<R: Resource>(&self, namespace: &str, name: &str) -> Result<R> {
        let key = ObjectKey::new(R::KIND, namespace, name);
        let object = self.get(&key).await?;
        R::from_object(object)
            .ok_or_else(|| ApheleiaError::invariant(format!("store returned wrong kind for {key}")))
    }

    /// Reads a record of type `R`, mapping not-found to `None`.
    async fn find_typed<R: Resource>(&self, namespace: &str, name: &str) -> Result<Option<R>> {
        match self.get_typed::<R>(namespace, name).await {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Lists records of type `R`.
    async fn list_typed<R: Resource>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<R>> {
        let objects = self.list(R::KIND, namespace, selector).await?;
        Ok(objects.into_iter().filter_map(R::from_object).collect())
    }

    /// Creates a record of type `R`.
    async fn create_typed<R: Resource>(&self, record: R) -> Result<R> {
        let key = record.key();
        let object = self.create(record.into_object()).await?;
        R::from_object(object)
            .ok_or_else(|| ApheleiaError::invariant(format!("store returned wrong kind for {key}")))
    }

    /// Writes metadata and spec of a record of type `R`.
    async fn update_typed<R: Resource>(&self, record: R) -> Result<R> {
        let key = record.key();
        let object = self.update(record.into_object()).await?;
        R::from_object(object)
            .ok_or_else(|| ApheleiaError::invariant(format!("store returned wrong kind for {key}")))
    }

    /// Writes the status of a record of type `R`.
    async fn update_status_typed<R: Resource>(&self, record: R) -> Result<R> {
        let key = record.key();
        let object = self.update_status(record.into_object()).await?;
        R::from_object(object)
            .ok_or_else(|| ApheleiaError::invariant(format!("store returned wrong kind for {key}")))
    }

    /// Creates `record`, or returns the stored winner if it already exists.
    ///
    /// The boolean is true when this call created it.
    async fn get_or_create<R: Resource>(&self, record: R) -> Result<(R, bool)> {
        let (namespace, name) = {
            let meta = record.metadata();
            (meta.namespace.clone(), meta.name.clone())
        };
        match self.create_typed(record).await {
            Ok(created) => Ok((created, true)),
            Err(err) if err.is_already_exists() => {
                let existing = self.get_typed::<R>(&namespace, &name).await?;
                Ok((existing, false))
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes a record, treating not-found as success.
    async fn delete_if_exists(&self, key: &ObjectKey) -> Result<bool> {
        match self.delete(key).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl<S: ObjectStore + ?Sized> TypedStore for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("b".to_string(), "2".to_string());

        assert!(LabelSelector::everything().matches(&labels));
        assert!(LabelSelector::everything().with("a", "1").matches(&labels));
        assert!(!LabelSelector::everything().with("a", "2").matches(&labels));
        assert!(!LabelSelector::everything().with("c", "1").matches(&labels));
    }

    #[test]
    fn test_resource_round_trip_through_object() {
        let abr = ArtifactBuild::new("ns", "g:a:1");
        let key = abr.key();
        let object = abr.clone().into_object();

        assert_eq!(object.key(), key);
        assert_eq!(object.kind(), Kind::ArtifactBuild);
        assert_eq!(ArtifactBuild::from_object(object.clone()), Some(abr));
        assert_eq!(DependencyBuild::from_object(object), None);
    }

    #[test]
    fn test_keep_status_rejects_kind_mismatch() {
        let mut abr = ArtifactBuild::new("ns", "g:a:1").into_object();
        let cb = ComponentBuild::new("ns", "cb", ["g:a:1"]).into_object();
        assert!(abr.keep_status_of(&cb).is_err());
    }
}
