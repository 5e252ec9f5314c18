//! `DependencyBuild`: the build of one repository checkout, shared by every
//! `ArtifactBuild` that discovered the same coordinates.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::artifact::ScmInfo;
use super::meta::ObjectMeta;
use crate::pipeline::RunRef;

/// Lifecycle of a `DependencyBuild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DependencyBuildState {
    /// Waiting for a build run.
    #[default]
    New,
    /// A build run is in flight.
    Building,
    /// Built and deployed with no outstanding contamination.
    Complete,
    /// The build run failed.
    Failed,
    /// Outputs embed artifacts that still need their own rebuild.
    Contaminated,
}

impl fmt::Display for DependencyBuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::Building => "Building",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::Contaminated => "Contaminated",
        };
        f.write_str(s)
    }
}

/// An artifact found embedded in this build's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contaminant {
    /// The embedded artifact, which must be rebuilt on its own.
    #[serde(rename = "gav")]
    pub gav: String,
    /// This build's outputs that carry it.
    #[serde(default)]
    pub contaminated_artifacts: Vec<String>,
}

/// Immutable part of a `DependencyBuild`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyBuildSpec {
    /// Checkout to build.
    pub scm_info: ScmInfo,
    /// Version being built, as reported by discovery.
    #[serde(default)]
    pub version: String,
}

/// Observed part of a `DependencyBuild`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyBuildStatus {
    /// Current state.
    pub state: DependencyBuildState,
    /// GAVs this build produced and published.
    #[serde(default)]
    pub deployed_artifacts: Vec<String>,
    /// Outstanding contamination.
    #[serde(default)]
    pub contaminants: Vec<Contaminant>,
    /// Human-readable detail for the current state.
    #[serde(default)]
    pub message: String,
    /// The build run being awaited.
    #[serde(default)]
    pub build_run: Option<RunRef>,
}

impl DependencyBuildStatus {
    /// Merges contaminants keyed by GAV, unioning their affected outputs.
    ///
    /// Returns true if anything changed.
    pub fn merge_contaminants(&mut self, incoming: Vec<Contaminant>) -> bool {
        let mut changed = false;
        for contaminant in incoming {
            match self.contaminants.iter_mut().find(|c| c.gav == contaminant.gav) {
                Some(existing) => {
                    for artifact in contaminant.contaminated_artifacts {
                        if !existing.contaminated_artifacts.contains(&artifact) {
                            existing.contaminated_artifacts.push(artifact);
                            changed = true;
                        }
                    }
                }
                None => {
                    self.contaminants.push(contaminant);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Removes the entry for `gav`, returning true if it was present.
    pub fn remove_contaminant(&mut self, gav: &str) -> bool {
        let before = self.contaminants.len();
        self.contaminants.retain(|c| c.gav != gav);
        before != self.contaminants.len()
    }

    /// Returns the contaminant GAV embedded in `artifact`, if any.
    #[must_use]
    pub fn contaminated_by(&self, artifact: &str) -> Option<&str> {
        self.contaminants
            .iter()
            .find(|c| c.contaminated_artifacts.iter().any(|a| a == artifact))
            .map(|c| c.gav.as_str())
    }

    /// Returns true if `gav` was deployed by this build.
    #[must_use]
    pub fn deployed(&self, gav: &str) -> bool {
        self.deployed_artifacts.iter().any(|a| a == gav)
    }
}

/// The build of one repository checkout.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyBuild {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Spec.
    pub spec: DependencyBuildSpec,
    /// Status.
    #[serde(default)]
    pub status: DependencyBuildStatus,
}

impl DependencyBuild {
    /// Creates an unsaved `DependencyBuild` keyed by its checkout.
    #[must_use]
    pub fn new(namespace: impl Into<String>, scm_info: ScmInfo, version: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, scm_info.dependency_build_id()),
            spec: DependencyBuildSpec {
                scm_info,
                version: version.into(),
            },
            status: DependencyBuildStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn contaminant(gav: &str, artifacts: &[&str]) -> Contaminant {
        Contaminant {
            gav: gav.to_string(),
            contaminated_artifacts: artifacts.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_new_is_keyed_by_checkout() {
        let scm = ScmInfo::git("https://example.com/r.git", "v1", "");
        let db = DependencyBuild::new("ns", scm.clone(), "1.0");
        assert_eq!(db.metadata.name, scm.dependency_build_id());
    }

    #[test]
    fn test_merge_contaminants_unions_by_gav() {
        let mut status = DependencyBuildStatus::default();
        assert!(status.merge_contaminants(vec![contaminant("g:z:1", &["g:a:1"])]));
        assert!(status.merge_contaminants(vec![
            contaminant("g:z:1", &["g:a:1", "g:b:1"]),
            contaminant("g:y:1", &["g:b:1"]),
        ]));
        assert!(!status.merge_contaminants(vec![contaminant("g:y:1", &["g:b:1"])]));

        assert_eq!(
            status.contaminants,
            vec![
                contaminant("g:z:1", &["g:a:1", "g:b:1"]),
                contaminant("g:y:1", &["g:b:1"]),
            ]
        );
    }

    #[test]
    fn test_contaminated_by_and_remove() {
        let mut status = DependencyBuildStatus::default();
        status.merge_contaminants(vec![contaminant("g:z:1", &["g:a:1"])]);

        assert_eq!(status.contaminated_by("g:a:1"), Some("g:z:1"));
        assert_eq!(status.contaminated_by("g:b:1"), None);

        assert!(status.remove_contaminant("g:z:1"));
        assert!(!status.remove_contaminant("g:z:1"));
        assert_eq!(status.contaminated_by("g:a:1"), None);
    }
}
