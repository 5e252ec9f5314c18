//! Data model: the three reconciled record kinds and their shared metadata.

mod artifact;
mod component;
mod dependency;
mod gav;
mod meta;

pub use artifact::{
    ArtifactBuild, ArtifactBuildSpec, ArtifactBuildState, ArtifactBuildStatus, RebuildPhase,
    ScmInfo,
};
pub use component::{
    derive_state, ArtifactState, ComponentBuild, ComponentBuildSpec, ComponentBuildState,
    ComponentBuildStatus,
};
pub use dependency::{
    Contaminant, DependencyBuild, DependencyBuildSpec, DependencyBuildState, DependencyBuildStatus,
};
pub use gav::Gav;
pub use meta::{
    Kind, ObjectKey, ObjectMeta, OwnerReference, CONTAMINATED_BY_ANNOTATION_PREFIX,
    OWNER_KIND_LABEL, OWNER_NAME_LABEL, PURPOSE_LABEL, REBUILD_ANNOTATION, SUBJECT_LABEL,
};
