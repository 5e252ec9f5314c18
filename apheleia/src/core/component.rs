//! `ComponentBuild`: a user request naming the artifacts to make available.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::artifact::ArtifactBuildState;
use super::meta::ObjectMeta;

/// Aggregate outcome of a `ComponentBuild`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ComponentBuildState {
    /// At least one artifact is still outstanding.
    #[default]
    InProgress,
    /// Every artifact completed.
    Complete,
    /// Every artifact is done and at least one failed.
    Failed,
}

impl ComponentBuildState {
    /// Returns true for Complete and Failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for ComponentBuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Per-artifact projection held in the component's status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactState {
    /// Name of the `ArtifactBuild` record.
    #[serde(default)]
    pub artifact_build: String,
    /// Complete, Failed or Missing.
    pub done: bool,
    /// Failed or Missing.
    pub failed: bool,
    /// A deploy run for this artifact succeeded in the current round.
    #[serde(default)]
    pub deployed: bool,
}

impl ArtifactState {
    /// Projects an `ArtifactBuild` state.
    #[must_use]
    pub fn project(artifact_build: impl Into<String>, state: ArtifactBuildState) -> Self {
        Self {
            artifact_build: artifact_build.into(),
            done: state.is_terminal(),
            failed: state.is_failure(),
            deployed: false,
        }
    }

    /// A requested coordinate that could never be built.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            artifact_build: String::new(),
            done: true,
            failed: true,
            deployed: false,
        }
    }

    /// Done and not failed.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.done && !self.failed
    }
}

/// Immutable part of a `ComponentBuild`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildSpec {
    /// Source repository of the component itself.
    #[serde(default, rename = "scmURL")]
    pub scm_url: String,
    /// Tag of the component's source.
    #[serde(default)]
    pub tag: String,
    /// Pull request the result is reported back to.
    #[serde(default, rename = "prURL")]
    pub pr_url: String,
    /// Requested GAVs.
    pub artifacts: Vec<String>,
}

/// Observed part of a `ComponentBuild`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildStatus {
    /// Aggregate state.
    pub state: ComponentBuildState,
    /// Number of artifacts not yet done.
    pub outstanding: usize,
    /// Projection of every requested artifact, keyed by GAV.
    #[serde(default)]
    pub artifact_state: BTreeMap<String, ArtifactState>,
    /// The result of the current round has been reported.
    #[serde(default)]
    pub result_notified: bool,
    /// Incremented each time a finished result is invalidated.
    #[serde(default)]
    pub round: u32,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

impl ComponentBuildStatus {
    /// Recomputes `outstanding` and `state` from `artifact_state`.
    pub fn recompute(&mut self) {
        let (outstanding, state) = derive_state(self.artifact_state.values());
        self.outstanding = outstanding;
        self.state = state;
    }
}

/// Derives `(outstanding, state)` from per-artifact projections.
pub fn derive_state<'a>(
    artifacts: impl IntoIterator<Item = &'a ArtifactState>,
) -> (usize, ComponentBuildState) {
    let mut outstanding = 0;
    let mut any_failed = false;
    for artifact in artifacts {
        if !artifact.done {
            outstanding += 1;
        } else if artifact.failed {
            any_failed = true;
        }
    }
    let state = match (outstanding, any_failed) {
        (0, false) => ComponentBuildState::Complete,
        (0, true) => ComponentBuildState::Failed,
        _ => ComponentBuildState::InProgress,
    };
    (outstanding, state)
}

/// A user request naming the artifacts to make available.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComponentBuild {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Spec.
    pub spec: ComponentBuildSpec,
    /// Status.
    #[serde(default)]
    pub status: ComponentBuildStatus,
}

impl ComponentBuild {
    /// Creates an unsaved request.
    #[must_use]
    pub fn new<I, S>(namespace: impl Into<String>, name: impl Into<String>, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: ComponentBuildSpec {
                artifacts: artifacts.into_iter().map(Into::into).collect(),
                ..ComponentBuildSpec::default()
            },
            status: ComponentBuildStatus::default(),
        }
    }

    /// Sets the pull request the result is reported to.
    #[must_use]
    pub fn with_pr_url(mut self, pr_url: impl Into<String>) -> Self {
        self.spec.pr_url = pr_url.into();
        self
    }
}
