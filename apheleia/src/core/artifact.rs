//! `ArtifactBuild`: the desired build of one artifact coordinate.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::meta::{ObjectMeta, CONTAMINATED_BY_ANNOTATION_PREFIX, REBUILD_ANNOTATION};
use crate::identity::{artifact_build_name, dependency_build_id};
use crate::pipeline::RunRef;

/// Where an artifact's source lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScmInfo {
    /// Repository URL.
    #[serde(rename = "scmURL")]
    pub scm_url: String,
    /// Tag or ref to check out.
    pub tag: String,
    /// Source control type (e.g. "git").
    #[serde(default)]
    pub scm_type: String,
    /// Sub-path of the build within the repository.
    #[serde(default)]
    pub path: String,
}

impl ScmInfo {
    /// Creates git coordinates.
    #[must_use]
    pub fn git(scm_url: impl Into<String>, tag: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scm_url: scm_url.into(),
            tag: tag.into(),
            scm_type: "git".to_string(),
            path: path.into(),
        }
    }

    /// The id of the `DependencyBuild` that builds this checkout.
    #[must_use]
    pub fn dependency_build_id(&self) -> String {
        dependency_build_id(&self.scm_url, &self.tag, &self.path)
    }
}

/// Lifecycle of an `ArtifactBuild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArtifactBuildState {
    /// Waiting for discovery to start.
    #[default]
    New,
    /// A discovery run is locating the source.
    Discovering,
    /// The owning `DependencyBuild` is running.
    Building,
    /// The artifact was rebuilt and deployed.
    Complete,
    /// The build failed or its output was contaminated.
    Failed,
    /// The source could not be located.
    Missing,
}

impl ArtifactBuildState {
    /// Complete, Failed and Missing only change on rebuild.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Missing)
    }

    /// Failed and Missing both count as failures upstream.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Missing)
    }
}

impl fmt::Display for ArtifactBuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::Discovering => "Discovering",
            Self::Building => "Building",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::Missing => "Missing",
        };
        f.write_str(s)
    }
}

/// Progress of a user-requested rebuild.
///
/// The request itself arrives as the [`REBUILD_ANNOTATION`]; this field
/// records how far its consumption has got so no pass has to infer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebuildPhase {
    /// No rebuild in progress.
    #[default]
    Cleared,
    /// The reset has been persisted; the annotation is still present.
    Pending,
    /// The annotation has been removed; discovery restarts next pass.
    Consumed,
}

/// Immutable part of an `ArtifactBuild`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactBuildSpec {
    /// The coordinate to rebuild.
    #[serde(rename = "gav")]
    pub gav: String,
}

/// Observed part of an `ArtifactBuild`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactBuildStatus {
    /// Current state.
    pub state: ArtifactBuildState,
    /// Discovered source coordinates.
    #[serde(default)]
    pub scm_info: Option<ScmInfo>,
    /// Human-readable detail for the current state.
    #[serde(default)]
    pub message: String,
    /// The discovery run being awaited.
    #[serde(default)]
    pub discovery_run: Option<RunRef>,
    /// Rebuild consumption progress.
    #[serde(default)]
    pub rebuild: RebuildPhase,
}

/// The desired build of one artifact coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtifactBuild {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Spec.
    pub spec: ArtifactBuildSpec,
    /// Status.
    #[serde(default)]
    pub status: ArtifactBuildStatus,
}

impl ArtifactBuild {
    /// Creates an unsaved `ArtifactBuild` named after its GAV.
    #[must_use]
    pub fn new(namespace: impl Into<String>, gav: impl Into<String>) -> Self {
        let gav = gav.into();
        Self {
            metadata: ObjectMeta::new(namespace, artifact_build_name(&gav)),
            spec: ArtifactBuildSpec { gav },
            status: ArtifactBuildStatus::default(),
        }
    }

    /// Returns true if a rebuild has been requested.
    #[must_use]
    pub fn rebuild_requested(&self) -> bool {
        self.metadata.annotations.contains_key(REBUILD_ANNOTATION)
    }

    /// `(annotation key, DependencyBuild name)` for every contamination link.
    #[must_use]
    pub fn contaminated_by(&self) -> Vec<(String, String)> {
        self.metadata
            .annotations
            .iter()
            .filter(|(k, _)| k.starts_with(CONTAMINATED_BY_ANNOTATION_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The `DependencyBuild` this artifact joined, if discovered.
    #[must_use]
    pub fn dependency_build_name(&self) -> Option<String> {
        self.status.scm_info.as_ref().map(ScmInfo::dependency_build_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::contaminated_by_annotation;

    #[test]
    fn test_new_uses_deterministic_name() {
        let a = ArtifactBuild::new("ns", "org.acme:widget:1.0");
        let b = ArtifactBuild::new("ns", "org.acme:widget:1.0");
        assert_eq!(a.metadata.name, b.metadata.name);
        assert_eq!(a.status.state, ArtifactBuildState::New);
        assert_eq!(a.status.rebuild, RebuildPhase::Cleared);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ArtifactBuildState::Complete.is_terminal());
        assert!(ArtifactBuildState::Missing.is_terminal());
        assert!(!ArtifactBuildState::Building.is_terminal());
        assert!(ArtifactBuildState::Missing.is_failure());
        assert!(!ArtifactBuildState::Complete.is_failure());
    }

    #[test]
    fn test_contaminated_by_links() {
        let mut abr = ArtifactBuild::new("ns", "org.acme:shaded:1.0");
        abr.metadata
            .set_annotation(contaminated_by_annotation("db-1"), "db-1");
        abr.metadata.set_annotation(REBUILD_ANNOTATION, "true");

        let links = abr.contaminated_by();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].1, "db-1");
        assert!(abr.rebuild_requested());
    }

    #[test]
    fn test_dependency_build_name_follows_scm_info() {
        let mut abr = ArtifactBuild::new("ns", "org.acme:widget:1.0");
        assert_eq!(abr.dependency_build_name(), None);

        let scm = ScmInfo::git("https://example.com/widget.git", "v1.0", "");
        abr.status.scm_info = Some(scm.clone());
        assert_eq!(abr.dependency_build_name(), Some(scm.dependency_build_id()));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let scm = ScmInfo::git("https://example.com/widget.git", "v1.0", "core");
        let json = serde_json::to_value(&scm).unwrap();
        assert_eq!(json["scmURL"], "https://example.com/widget.git");
        assert_eq!(json["scmType"], "git");
    }
}
