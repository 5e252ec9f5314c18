//! # Apheleia
//!
//! A reconciliation engine that rebuilds the dependency graph of a software
//! component from source.
//!
//! A user declares a [`ComponentBuild`](core::ComponentBuild) listing the
//! artifact coordinates it depends on. The engine then drives three kinds of
//! stored records toward their desired state:
//!
//! - **`ComponentBuild`**: fans out into one `ArtifactBuild` per coordinate,
//!   deploys what was rebuilt and notifies once per round
//! - **`ArtifactBuild`**: discovers the source repository of one coordinate
//!   and joins the `DependencyBuild` for that repository
//! - **`DependencyBuild`**: builds one repository at one tag, at most once,
//!   however many artifacts come from it
//!
//! Long-running work (discovery, builds, deploys, notifications) runs as
//! external pipeline runs behind the [`PipelineBackend`](pipeline::PipelineBackend)
//! trait. Records live behind [`ObjectStore`](store::ObjectStore).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use apheleia::prelude::*;
//!
//! let config = Arc::new(ControllerConfig::from_file("apheleia.json")?);
//! let dispatcher = Dispatcher::new(backend, config.clone());
//! let ctx = Context::new(store, dispatcher, Arc::new(LoggingEventRecorder::default()));
//!
//! let controller = Controller::new(ctx, config);
//! controller.watch_namespace("builds");
//! controller.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod controller;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod identity;
pub mod observability;
pub mod pipeline;
pub mod reconciler;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ControllerConfig, DeployConfig, NotifyConfig, PipelineRetryConfig};
    pub use crate::controller::{BackoffConfig, Controller, WorkQueue};
    pub use crate::core::{
        ArtifactBuild, ArtifactBuildState, ComponentBuild, ComponentBuildState, DependencyBuild,
        DependencyBuildState, Gav, Kind, ObjectKey, ObjectMeta, ScmInfo,
    };
    pub use crate::dispatch::{Dispatcher, RunProgress};
    pub use crate::errors::{ApheleiaError, Result};
    pub use crate::events::{EventRecorder, LoggingEventRecorder, ReconcileEvent};
    pub use crate::identity::{artifact_build_name, dependency_build_id};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{InMemoryPipelineBackend, PipelineBackend, PipelinePurpose};
    pub use crate::reconciler::{Context, ReconcileOutcome, Reconciler};
    pub use crate::store::{InMemoryStore, ObjectStore, TypedStore};
    pub use std::sync::Arc;
}
