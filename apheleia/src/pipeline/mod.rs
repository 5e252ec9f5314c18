//! Pipeline execution backend port.
//!
//! The engine never looks at how a run executes. It creates runs labelled
//! with a purpose, an owning record and an optional subject, and later reads
//! back the completion flag, the success flag and the declared results.

mod memory;
pub mod results;

pub use memory::InMemoryPipelineBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;

use crate::core::ObjectKey;
use crate::errors::Result;

/// What a run is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePurpose {
    /// Locate the source of an artifact.
    Discover,
    /// Build a repository checkout.
    Build,
    /// Publish one artifact of a component.
    Deploy,
    /// Report a component's result.
    Notify,
}

impl PipelinePurpose {
    /// Label value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Build => "build",
            Self::Deploy => "deploy",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for PipelinePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunRef(pub String);

impl RunRef {
    /// Wraps a run id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The run id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Purpose label.
    pub purpose: PipelinePurpose,
    /// Record the run reports back to.
    pub owner: ObjectKey,
    /// Distinguishes several runs of one purpose under one owner.
    pub subject: Option<String>,
    /// Task to run.
    pub task: String,
    /// Task parameters.
    pub params: BTreeMap<String, String>,
}

/// Selects runs by their labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunQuery {
    /// Purpose label.
    pub purpose: PipelinePurpose,
    /// Owner labels.
    pub owner: ObjectKey,
    /// Subject label; `None` matches runs without one.
    pub subject: Option<String>,
}

impl RunQuery {
    /// Creates a query.
    #[must_use]
    pub fn new(purpose: PipelinePurpose, owner: ObjectKey, subject: Option<String>) -> Self {
        Self {
            purpose,
            owner,
            subject,
        }
    }

    /// Returns true if `run` carries this query's labels.
    #[must_use]
    pub fn matches(&self, run: &RunStatus) -> bool {
        run.purpose == self.purpose && run.owner == self.owner && run.subject == self.subject
    }
}

/// Observed state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Run reference.
    pub run: RunRef,
    /// Purpose label.
    pub purpose: PipelinePurpose,
    /// Owning record.
    pub owner: ObjectKey,
    /// Subject label.
    pub subject: Option<String>,
    /// Task that was run.
    pub task: String,
    /// Parameters the run was started with.
    pub params: BTreeMap<String, String>,
    /// The run has finished.
    pub completed: bool,
    /// The run finished successfully.
    pub succeeded: bool,
    /// Declared result key/value pairs.
    pub results: BTreeMap<String, String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    /// Not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        !self.completed
    }

    /// Completed without success.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.completed && !self.succeeded
    }

    /// A declared result, trimmed, if present and non-empty.
    #[must_use]
    pub fn result(&self, key: &str) -> Option<&str> {
        self.results
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Type of a run notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEventType {
    /// The run was started.
    Created,
    /// The run finished.
    Completed,
}

/// A run notification, used to wake up the owning record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    /// What happened.
    pub event_type: RunEventType,
    /// The run after the change.
    pub status: RunStatus,
}

/// The external pipeline execution backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Starts a run.
    async fn create_run(&self, request: RunRequest) -> Result<RunRef>;

    /// Reads a run.
    async fn get_run(&self, run: &RunRef) -> Result<RunStatus>;

    /// Lists runs carrying the query's labels, oldest first.
    async fn find_runs(&self, query: &RunQuery) -> Result<Vec<RunStatus>>;

    /// Subscribes to run notifications.
    fn watch(&self) -> broadcast::Receiver<RunEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Kind;

    fn status(completed: bool, succeeded: bool) -> RunStatus {
        RunStatus {
            run: RunRef::new("r"),
            purpose: PipelinePurpose::Build,
            owner: ObjectKey::new(Kind::DependencyBuild, "ns", "db"),
            subject: None,
            task: "build".to_string(),
            params: BTreeMap::new(),
            completed,
            succeeded,
            results: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_run_status_flags() {
        assert!(status(false, false).in_flight());
        assert!(status(true, false).failed());
        assert!(!status(true, true).failed());
    }

    #[test]
    fn test_result_ignores_blank_values() {
        let mut run = status(true, true);
        run.results.insert("SCM_URL".to_string(), "  ".to_string());
        run.results.insert("SCM_TAG".to_string(), " v1 ".to_string());
        assert_eq!(run.result("SCM_URL"), None);
        assert_eq!(run.result("SCM_TAG"), Some("v1"));
        assert_eq!(run.result("MISSING"), None);
    }

    #[test]
    fn test_query_matches_subject() {
        let run = status(false, false);
        let owner = run.owner.clone();
        assert!(RunQuery::new(PipelinePurpose::Build, owner.clone(), None).matches(&run));
        assert!(!RunQuery::new(PipelinePurpose::Build, owner.clone(), Some("x".into())).matches(&run));
        assert!(!RunQuery::new(PipelinePurpose::Deploy, owner, None).matches(&run));
    }

    #[test]
    fn test_purpose_labels() {
        assert_eq!(PipelinePurpose::Discover.to_string(), "discover");
        assert_eq!(
            serde_json::to_string(&PipelinePurpose::Notify).unwrap(),
            "\"notify\""
        );
    }
}
