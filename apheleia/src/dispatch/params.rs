//! Parameter sets for each pipeline purpose.

use std::collections::BTreeMap;

use crate::config::{DeployConfig, NotifyConfig};
use crate::core::{ComponentBuildState, ScmInfo};

/// Parameters of a discovery run.
#[must_use]
pub fn discovery(gav: &str) -> BTreeMap<String, String> {
    params([("GAV", gav)])
}

/// Parameters of a build run.
#[must_use]
pub fn build(scm: &ScmInfo, version: &str, image: &str) -> BTreeMap<String, String> {
    params([
        ("URL", scm.scm_url.as_str()),
        ("TAG", scm.tag.as_str()),
        ("CONTEXT", scm.path.as_str()),
        ("VERSION", version),
        ("IMAGE", image),
    ])
}

/// Parameters of a deploy run for one artifact.
#[must_use]
pub fn deploy(gav: &str, target: &DeployConfig) -> BTreeMap<String, String> {
    params([
        ("GAV", gav),
        ("REPO", target.maven_repo.as_str()),
        ("DOMAIN", target.aws_domain.as_str()),
        ("OWNER", target.aws_owner.as_str()),
        ("FORCE", if target.force { "true" } else { "false" }),
    ])
}

/// Parameters of a notify run.
#[must_use]
pub fn notify(
    component: &str,
    state: ComponentBuildState,
    message: &str,
    pr_url: &str,
    settings: &NotifyConfig,
) -> BTreeMap<String, String> {
    let mut out = settings.extra_params.clone();
    let state = state.to_string();
    out.extend(params([
        ("COMPONENT", component),
        ("STATE", state.as_str()),
        ("MESSAGE", message),
        ("PR_URL", pr_url),
    ]));
    out
}

fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_params() {
        let scm = ScmInfo::git("https://example.com/r.git", "v1", "core");
        let p = build(&scm, "1.0", "builder:latest");
        assert_eq!(p["URL"], "https://example.com/r.git");
        assert_eq!(p["TAG"], "v1");
        assert_eq!(p["CONTEXT"], "core");
        assert_eq!(p["VERSION"], "1.0");
        assert_eq!(p["IMAGE"], "builder:latest");
    }

    #[test]
    fn test_deploy_params() {
        let target = DeployConfig::new("https://repo").with_aws("rhosak", "237843776254");
        let p = deploy("g:a:1", &target);
        assert_eq!(p["REPO"], "https://repo");
        assert_eq!(p["DOMAIN"], "rhosak");
        assert_eq!(p["OWNER"], "237843776254");
        assert_eq!(p["FORCE"], "false");
    }

    #[test]
    fn test_notify_params_override_extras() {
        let mut settings = NotifyConfig::default();
        settings.extra_params.insert("CHANNEL".to_string(), "#builds".to_string());
        settings.extra_params.insert("STATE".to_string(), "bogus".to_string());

        let p = notify("cb", ComponentBuildState::Failed, "1 failed", "https://pr/1", &settings);
        assert_eq!(p["CHANNEL"], "#builds");
        assert_eq!(p["STATE"], "Failed");
        assert_eq!(p["PR_URL"], "https://pr/1");
    }
}
