//! Typed decoding of the result key/value pairs declared by completed runs.

use serde::Deserialize;

use super::RunStatus;
use crate::core::{Contaminant, ScmInfo};
use crate::errors::Result;

/// Discovered repository URL.
pub const SCM_URL: &str = "SCM_URL";
/// Discovered tag.
pub const SCM_TAG: &str = "SCM_TAG";
/// Discovered source control type.
pub const SCM_TYPE: &str = "SCM_TYPE";
/// Discovered sub-path within the repository.
pub const CONTEXT_PATH: &str = "CONTEXT_PATH";
/// Version the repository builds.
pub const VERSION: &str = "VERSION";
/// Free-form detail from the run.
pub const MESSAGE: &str = "MESSAGE";
/// Comma-separated GAVs a build deployed.
pub const DEPLOYED_ARTIFACTS: &str = "DEPLOYED_ARTIFACTS";
/// JSON array of `{gav, contaminatedArtifacts}`.
pub const CONTAMINANTS: &str = "CONTAMINANTS";

const DEFAULT_SCM_TYPE: &str = "git";

/// Outcome of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    /// Source coordinates; `None` if the source could not be located.
    pub scm_info: Option<ScmInfo>,
    /// Version the repository builds.
    pub version: String,
    /// Detail reported by the run.
    pub message: Option<String>,
}

impl DiscoveryResult {
    /// Decodes a completed discovery run.
    ///
    /// A failed run, or one that did not report both a URL and a tag, yields
    /// no coordinates.
    #[must_use]
    pub fn from_run(run: &RunStatus) -> Self {
        let scm_info = match (run.succeeded, run.result(SCM_URL), run.result(SCM_TAG)) {
            (true, Some(url), Some(tag)) => Some(ScmInfo {
                scm_url: url.to_string(),
                tag: tag.to_string(),
                scm_type: run.result(SCM_TYPE).unwrap_or(DEFAULT_SCM_TYPE).to_string(),
                path: run.result(CONTEXT_PATH).unwrap_or_default().to_string(),
            }),
            _ => None,
        };
        Self {
            scm_info,
            version: run.result(VERSION).unwrap_or_default().to_string(),
            message: run.result(MESSAGE).map(ToString::to_string),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContaminant {
    gav: String,
    #[serde(default)]
    contaminated_artifacts: Vec<String>,
}

/// Outcome of a build run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildResult {
    /// GAVs the build published.
    pub deployed_artifacts: Vec<String>,
    /// Embedded artifacts found in the outputs.
    pub contaminants: Vec<Contaminant>,
    /// Detail reported by the run.
    pub message: Option<String>,
}

impl BuildResult {
    /// Decodes a completed build run. Fails on a malformed contaminant list.
    pub fn from_run(run: &RunStatus) -> Result<Self> {
        let deployed_artifacts = run
            .result(DEPLOYED_ARTIFACTS)
            .map(split_list)
            .unwrap_or_default();

        let contaminants = match run.result(CONTAMINANTS) {
            Some(json) => serde_json::from_str::<Vec<WireContaminant>>(json)?
                .into_iter()
                .filter(|c| !c.gav.trim().is_empty())
                .map(|c| Contaminant {
                    gav: c.gav.trim().to_string(),
                    contaminated_artifacts: c.contaminated_artifacts,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            deployed_artifacts,
            contaminants,
            message: run.result(MESSAGE).map(ToString::to_string),
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
