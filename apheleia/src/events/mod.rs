//! Reconcile events.
//!
//! Every state transition the reconcilers persist is also announced as a
//! [`ReconcileEvent`] to the configured [`EventRecorder`].

mod recorder;

pub use recorder::{
    CollectingEventRecorder, EventRecorder, LoggingEventRecorder, NoOpEventRecorder,
};

use serde::Serialize;

use crate::core::{
    ArtifactBuildState, ComponentBuildState, DependencyBuildState, ObjectKey,
};
use crate::pipeline::{PipelinePurpose, RunRef};

/// Something a reconciler did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconcileEvent {
    /// An `ArtifactBuild` changed state.
    ArtifactBuildStateChanged {
        /// The record.
        key: ObjectKey,
        /// Previous state.
        from: ArtifactBuildState,
        /// New state.
        to: ArtifactBuildState,
    },
    /// A `DependencyBuild` changed state.
    DependencyBuildStateChanged {
        /// The record.
        key: ObjectKey,
        /// Previous state.
        from: DependencyBuildState,
        /// New state.
        to: DependencyBuildState,
    },
    /// A `ComponentBuild` changed state.
    ComponentBuildStateChanged {
        /// The record.
        key: ObjectKey,
        /// Previous state.
        from: ComponentBuildState,
        /// New state.
        to: ComponentBuildState,
        /// Artifacts still outstanding.
        outstanding: usize,
    },
    /// A build found an embedded artifact in one of its outputs.
    ContaminantDiscovered {
        /// The `DependencyBuild`.
        key: ObjectKey,
        /// The embedded GAV.
        gav: String,
        /// Outputs carrying it.
        contaminated_artifacts: Vec<String>,
    },
    /// A contaminant was rebuilt and no longer blocks the build.
    ContaminantCleared {
        /// The `DependencyBuild`.
        key: ObjectKey,
        /// The embedded GAV.
        gav: String,
    },
    /// A user-requested rebuild reset an `ArtifactBuild`.
    RebuildRequested {
        /// The record.
        key: ObjectKey,
    },
    /// A pipeline run was started.
    PipelineRunCreated {
        /// The owning record.
        key: ObjectKey,
        /// Purpose.
        purpose: PipelinePurpose,
        /// The run.
        run: RunRef,
    },
    /// A `DependencyBuild` with no owners was removed.
    DependencyBuildDeleted {
        /// The record.
        key: ObjectKey,
    },
}

impl ReconcileEvent {
    /// Dotted event type, e.g. `artifact_build.state_changed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ArtifactBuildStateChanged { .. } => "artifact_build.state_changed",
            Self::DependencyBuildStateChanged { .. } => "dependency_build.state_changed",
            Self::ComponentBuildStateChanged { .. } => "component_build.state_changed",
            Self::ContaminantDiscovered { .. } => "dependency_build.contaminant_discovered",
            Self::ContaminantCleared { .. } => "dependency_build.contaminant_cleared",
            Self::RebuildRequested { .. } => "artifact_build.rebuild_requested",
            Self::PipelineRunCreated { .. } => "pipeline_run.created",
            Self::DependencyBuildDeleted { .. } => "dependency_build.deleted",
        }
    }

    /// The record the event is about.
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::ArtifactBuildStateChanged { key, .. }
            | Self::DependencyBuildStateChanged { key, .. }
            | Self::ComponentBuildStateChanged { key, .. }
            | Self::ContaminantDiscovered { key, .. }
            | Self::ContaminantCleared { key, .. }
            | Self::RebuildRequested { key }
            | Self::PipelineRunCreated { key, .. }
            | Self::DependencyBuildDeleted { key } => key,
        }
    }

    /// One-line human-readable summary.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::ArtifactBuildStateChanged { key, from, to } => {
                format!("{} {from} -> {to}", key.name)
            }
            Self::DependencyBuildStateChanged { key, from, to } => {
                format!("{} {from} -> {to}", key.name)
            }
            Self::ComponentBuildStateChanged {
                key,
                from,
                to,
                outstanding,
            } => format!("{} {from} -> {to} ({outstanding} outstanding)", key.name),
            Self::ContaminantDiscovered {
                key,
                gav,
                contaminated_artifacts,
            } => format!(
                "{} is contaminated by {gav} in {}",
                key.name,
                contaminated_artifacts.join(", ")
            ),
            Self::ContaminantCleared { key, gav } => {
                format!("{} no longer blocked by {gav}", key.name)
            }
            Self::RebuildRequested { key } => format!("rebuild of {} requested", key.name),
            Self::PipelineRunCreated { key, purpose, run } => {
                format!("{purpose} run {run} created for {}", key.name)
            }
            Self::DependencyBuildDeleted { key } => format!("{} deleted", key.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Kind;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ReconcileEvent::ContaminantCleared {
            key: ObjectKey::new(Kind::DependencyBuild, "ns", "db"),
            gav: "g:z:1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "contaminant_cleared");
        assert_eq!(json["gav"], "g:z:1");
        assert_eq!(event.key().name, "db");
        assert_eq!(event.describe(), "db no longer blocked by g:z:1");
    }
}
