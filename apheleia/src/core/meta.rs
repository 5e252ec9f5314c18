//! Object identity, metadata and ownership shared by every stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::errors::{ApheleiaError, Result};

/// Annotation a user sets on an `ArtifactBuild` to request a rebuild.
pub const REBUILD_ANNOTATION: &str = "apheleia.io/rebuild";

/// Prefix of the annotation linking an `ArtifactBuild` to the
/// `DependencyBuild` that flagged it during contamination analysis.
pub const CONTAMINATED_BY_ANNOTATION_PREFIX: &str = "apheleia.io/contaminated-by-";

/// Label carrying the purpose of a pipeline run.
pub const PURPOSE_LABEL: &str = "apheleia.io/purpose";

/// Label carrying the kind of the record that owns a pipeline run.
pub const OWNER_KIND_LABEL: &str = "apheleia.io/owner-kind";

/// Label carrying the name of the record that owns a pipeline run.
pub const OWNER_NAME_LABEL: &str = "apheleia.io/owner";

/// Label distinguishing several runs of one purpose under one owner.
pub const SUBJECT_LABEL: &str = "apheleia.io/subject";

/// The kinds of record the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    /// A user request for a set of artifacts.
    ComponentBuild,
    /// The build of a single artifact coordinate.
    ArtifactBuild,
    /// The build of one repository checkout.
    DependencyBuild,
}

impl Kind {
    /// All kinds, in reconcile priority order.
    pub const ALL: [Kind; 3] = [Kind::ComponentBuild, Kind::ArtifactBuild, Kind::DependencyBuild];

    /// Parses a kind from its display name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ComponentBuild" => Some(Self::ComponentBuild),
            "ArtifactBuild" => Some(Self::ArtifactBuild),
            "DependencyBuild" => Some(Self::DependencyBuild),
            _ => None,
        }
    }

    /// Returns the display name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComponentBuild => "ComponentBuild",
            Self::ArtifactBuild => "ArtifactBuild",
            Self::DependencyBuild => "DependencyBuild",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of a stored record; also the work-queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// The record kind.
    pub kind: Kind,
    /// The namespace the record lives in.
    pub namespace: String,
    /// The record name.
    pub name: String,
}

impl ObjectKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns a key of another kind in the same namespace.
    #[must_use]
    pub fn sibling(&self, kind: Kind, name: impl Into<String>) -> Self {
        Self::new(kind, self.namespace.clone(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A durable parent reference used for cascading deletion and for mapping
/// watch events back to the records that must be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner.
    pub kind: Kind,
    /// Name of the owner (same namespace).
    pub name: String,
    /// Uid of the owner, so a re-created namesake is not mistaken for it.
    pub uid: Uuid,
    /// Whether this owner is the managing controller.
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Builds a reference to a stored owner.
    ///
    /// Fails if the owner has not been persisted yet (it has no uid).
    pub fn to(kind: Kind, owner: &ObjectMeta, controller: bool) -> Result<Self> {
        if owner.uid.is_nil() {
            return Err(ApheleiaError::invariant(format!(
                "{kind} {} has no uid and cannot own other records",
                owner.name
            )));
        }
        Ok(Self {
            kind,
            name: owner.name.clone(),
            uid: owner.uid,
            controller,
        })
    }
}

/// Metadata carried by every stored record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Record name, unique per kind and namespace.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: Uuid,
    /// Bumped by the store on every effective write.
    #[serde(default)]
    pub resource_version: u64,
    /// Assigned by the store on create.
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Identifying labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Non-identifying annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Owners of this record.
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Creates metadata for a record that has not been stored yet.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Returns the annotation value, if present.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Sets an annotation, returning true if anything changed.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        let key = key.into();
        if self.annotations.get(&key) == Some(&value) {
            return false;
        }
        self.annotations.insert(key, value);
        true
    }

    /// Removes an annotation, returning true if it was present.
    pub fn remove_annotation(&mut self, key: &str) -> bool {
        self.annotations.remove(key).is_some()
    }

    /// Returns true if `uid` is among the owners.
    #[must_use]
    pub fn is_owned_by(&self, uid: Uuid) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }

    /// Adds an owner unless already present, returning true if added.
    pub fn add_owner(&mut self, owner: OwnerReference) -> bool {
        if self.is_owned_by(owner.uid) {
            return false;
        }
        self.owner_references.push(owner);
        true
    }

    /// Removes an owner, returning true if it was present.
    pub fn remove_owner(&mut self, uid: Uuid) -> bool {
        let before = self.owner_references.len();
        self.owner_references.retain(|r| r.uid != uid);
        before != self.owner_references.len()
    }

    /// Names of the owners of the given kind.
    #[must_use]
    pub fn owners_of_kind(&self, kind: Kind) -> Vec<String> {
        self.owner_references
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(name: &str) -> ObjectMeta {
        let mut meta = ObjectMeta::new("default", name);
        meta.uid = Uuid::new_v4();
        meta
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new(Kind::DependencyBuild, "ns", "abc");
        assert_eq!(key.to_string(), "DependencyBuild/ns/abc");
        assert_eq!(key.sibling(Kind::ArtifactBuild, "x").namespace, "ns");
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in Kind::ALL {
            assert_eq!(Kind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Kind::parse("PipelineRun"), None);
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let unsaved = ObjectMeta::new("default", "cb");
        assert!(OwnerReference::to(Kind::ComponentBuild, &unsaved, true).is_err());

        let saved = stored("cb");
        let owner = OwnerReference::to(Kind::ComponentBuild, &saved, true).unwrap();
        assert_eq!(owner.uid, saved.uid);
    }

    #[test]
    fn test_add_owner_is_idempotent() {
        let owner = stored("a");
        let mut meta = stored("db");
        let reference = OwnerReference::to(Kind::ArtifactBuild, &owner, false).unwrap();

        assert!(meta.add_owner(reference.clone()));
        assert!(!meta.add_owner(reference));
        assert_eq!(meta.owners_of_kind(Kind::ArtifactBuild), vec!["a".to_string()]);

        assert!(meta.remove_owner(owner.uid));
        assert!(!meta.remove_owner(owner.uid));
        assert!(meta.owner_references.is_empty());
    }

    #[test]
    fn test_annotations() {
        let mut meta = stored("a");
        assert!(meta.set_annotation(REBUILD_ANNOTATION, "true"));
        assert!(!meta.set_annotation(REBUILD_ANNOTATION, "true"));
        assert_eq!(meta.annotation(REBUILD_ANNOTATION), Some("true"));
        assert!(meta.remove_annotation(REBUILD_ANNOTATION));
        assert!(!meta.remove_annotation(REBUILD_ANNOTATION));
    }
}
