//! Controller configuration.
//!
//! Everything the engine would otherwise look up globally (task names, the
//! builder image, deployment coordinates, retry policy) lives here and is
//! handed to the dispatcher and the controller at construction.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::controller::{BackoffConfig, BackoffStrategy, JitterStrategy};
use crate::errors::{ApheleiaError, Result};

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Hard deadline for one reconcile call.
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_seconds: u64,
    /// Requeue backoff after a transient failure.
    #[serde(default)]
    pub requeue: BackoffConfig,
    /// Retry policy for failed deploy and notify runs.
    #[serde(default)]
    pub pipeline_retry: PipelineRetryConfig,
    /// Task names and images used for pipeline runs.
    #[serde(default)]
    pub pipelines: PipelineNames,
    /// Deployment target.
    #[serde(default)]
    pub deploy: DeployConfig,
    /// Result notification settings.
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_workers() -> usize {
    4
}

fn default_reconcile_timeout() -> u64 {
    300
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            reconcile_timeout_seconds: default_reconcile_timeout(),
            requeue: BackoffConfig::default(),
            pipeline_retry: PipelineRetryConfig::default(),
            pipelines: PipelineNames::default(),
            deploy: DeployConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON file, applies environment overrides and validates.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `APHELEIA_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("APHELEIA_WORKERS") {
            self.workers = parse_number("APHELEIA_WORKERS", &value)?;
        }
        if let Some(value) = lookup("APHELEIA_RECONCILE_TIMEOUT_SECONDS") {
            self.reconcile_timeout_seconds =
                parse_number("APHELEIA_RECONCILE_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = lookup("APHELEIA_MAVEN_REPO") {
            self.deploy.maven_repo = value;
        }
        if let Some(value) = lookup("APHELEIA_AWS_DOMAIN") {
            self.deploy.aws_domain = value;
        }
        if let Some(value) = lookup("APHELEIA_AWS_OWNER") {
            self.deploy.aws_owner = value;
        }
        Ok(())
    }

    /// Rejects configurations the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ApheleiaError::Config("workers must be at least 1".to_string()));
        }
        if self.reconcile_timeout_seconds == 0 {
            return Err(ApheleiaError::Config(
                "reconcile_timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.pipeline_retry.max_attempts == 0 {
            return Err(ApheleiaError::Config(
                "pipeline_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.deploy.maven_repo.trim().is_empty() {
            return Err(ApheleiaError::Config("deploy.maven_repo must be set".to_string()));
        }
        Ok(())
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the reconcile deadline.
    #[must_use]
    pub fn with_reconcile_timeout_seconds(mut self, seconds: u64) -> Self {
        self.reconcile_timeout_seconds = seconds;
        self
    }

    /// Sets the requeue backoff.
    #[must_use]
    pub fn with_requeue(mut self, requeue: BackoffConfig) -> Self {
        self.requeue = requeue;
        self
    }

    /// Sets the deploy/notify retry policy.
    #[must_use]
    pub fn with_pipeline_retry(mut self, retry: PipelineRetryConfig) -> Self {
        self.pipeline_retry = retry;
        self
    }

    /// Sets the deployment target.
    #[must_use]
    pub fn with_deploy(mut self, deploy: DeployConfig) -> Self {
        self.deploy = deploy;
        self
    }

    /// The reconcile deadline as a duration.
    #[must_use]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_seconds)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ApheleiaError::Config(format!("{name} must be a number, got '{value}'")))
}

/// Retry policy for deploy and notify runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRetryConfig {
    /// Runs attempted before giving up, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait between a failed run's completion and the next attempt.
    #[serde(default = "default_pipeline_backoff")]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_pipeline_backoff() -> BackoffConfig {
    BackoffConfig::new()
        .with_base_delay_ms(10_000)
        .with_max_delay_ms(300_000)
        .with_strategy(BackoffStrategy::Exponential)
        .with_jitter(JitterStrategy::None)
}

impl Default for PipelineRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_pipeline_backoff(),
        }
    }
}

impl PipelineRetryConfig {
    /// Sets the attempt limit.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the wait policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Task names and images for each pipeline purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineNames {
    /// Source discovery task.
    #[serde(default = "default_discover_task")]
    pub discover_task: String,
    /// Repository build task.
    #[serde(default = "default_build_task")]
    pub build_task: String,
    /// Artifact deployment task.
    #[serde(default = "default_deploy_task")]
    pub deploy_task: String,
    /// Result notification task.
    #[serde(default = "default_notify_task")]
    pub notify_task: String,
    /// Image the build task runs in.
    #[serde(default = "default_builder_image")]
    pub builder_image: String,
}

fn default_discover_task() -> String {
    "apheleia-discover".to_string()
}

fn default_build_task() -> String {
    "apheleia-build".to_string()
}

fn default_deploy_task() -> String {
    "apheleia-deploy".to_string()
}

fn default_notify_task() -> String {
    "apheleia-notify".to_string()
}

fn default_builder_image() -> String {
    "quay.io/redhat-appstudio/hacbs-jvm-build-request-processor:latest".to_string()
}

impl Default for PipelineNames {
    fn default() -> Self {
        Self {
            discover_task: default_discover_task(),
            build_task: default_build_task(),
            deploy_task: default_deploy_task(),
            notify_task: default_notify_task(),
            builder_image: default_builder_image(),
        }
    }
}

/// Where deploy runs publish artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Maven repository URL (the deploy task's `REPO`).
    pub maven_repo: String,
    /// Artifact repository domain (`DOMAIN`).
    pub aws_domain: String,
    /// Artifact repository owner account (`OWNER`).
    pub aws_owner: String,
    /// Overwrite existing artifacts (`FORCE`).
    pub force: bool,
}

impl DeployConfig {
    /// Creates a deploy target.
    #[must_use]
    pub fn new(maven_repo: impl Into<String>) -> Self {
        Self {
            maven_repo: maven_repo.into(),
            ..Self::default()
        }
    }

    /// Sets the repository domain and owner.
    #[must_use]
    pub fn with_aws(mut self, domain: impl Into<String>, owner: impl Into<String>) -> Self {
        self.aws_domain = domain.into();
        self.aws_owner = owner.into();
        self
    }
}

/// Result notification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Skip notify runs entirely; results are still recorded on the status.
    pub disabled: bool,
    /// Extra parameters passed verbatim to every notify run.
    pub extra_params: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(300));
        assert_eq!(config.pipeline_retry.max_attempts, 5);
        assert_eq!(config.pipeline_retry.backoff.ceiling(0), Duration::from_secs(10));
        assert_eq!(config.pipeline_retry.backoff.ceiling(10), Duration::from_secs(300));
        assert_eq!(config.pipelines.deploy_task, "apheleia-deploy");
    }

    #[test]
    fn test_default_requires_deploy_repo() {
        let err = ControllerConfig::default().validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG");

        let config = ControllerConfig::default().with_deploy(DeployConfig::new("https://repo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ControllerConfig::from_json_str(
            r#"{"workers": 8, "deploy": {"maven_repo": "https://repo"}}"#,
        )
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.reconcile_timeout_seconds, 300);
        assert_eq!(config.deploy.maven_repo, "https://repo");
        assert_eq!(config.requeue, BackoffConfig::default());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("APHELEIA_WORKERS", "2"),
            ("APHELEIA_MAVEN_REPO", "https://override"),
            ("APHELEIA_AWS_OWNER", "1234"),
        ]
        .into_iter()
        .collect();

        let mut config = ControllerConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.deploy.maven_repo, "https://override");
        assert_eq!(config.deploy.aws_owner, "1234");
        assert_eq!(config.deploy.aws_domain, "");
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = ControllerConfig::default();
        let err = config
            .apply_overrides(|name| (name == "APHELEIA_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("APHELEIA_WORKERS"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"reconcile_timeout_seconds": 60, "deploy": {{"maven_repo": "https://repo", "force": true}}}}"#
        )
        .unwrap();

        let config = ControllerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reconcile_timeout_seconds, 60);
        assert!(config.deploy.force);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers": 0, "deploy": {{"maven_repo": "https://repo"}}}}"#).unwrap();
        assert!(ControllerConfig::from_file(file.path()).is_err());
    }
}
