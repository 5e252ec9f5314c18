//! Maven coordinate parsing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::errors::{ApheleiaError, Result};

#[allow(clippy::expect_used)]
static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-+]*$").expect("segment pattern is valid"));

/// A parsed `group:artifact[:type[:classifier]]:version` coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gav {
    /// Group id.
    pub group: String,
    /// Artifact id.
    pub artifact: String,
    /// Packaging type, when given.
    pub packaging: Option<String>,
    /// Classifier, when given.
    pub classifier: Option<String>,
    /// Version.
    pub version: String,
}

impl Gav {
    /// Parses a coordinate string.
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        if parts.iter().any(|p| !SEGMENT.is_match(p)) {
            return Err(ApheleiaError::InvalidGav(value.to_string()));
        }
        let owned = |s: &str| s.to_string();
        match parts.as_slice() {
            [g, a, v] => Ok(Self {
                group: owned(g),
                artifact: owned(a),
                packaging: None,
                classifier: None,
                version: owned(v),
            }),
            [g, a, t, v] => Ok(Self {
                group: owned(g),
                artifact: owned(a),
                packaging: Some(owned(t)),
                classifier: None,
                version: owned(v),
            }),
            [g, a, t, c, v] => Ok(Self {
                group: owned(g),
                artifact: owned(a),
                packaging: Some(owned(t)),
                classifier: Some(owned(c)),
                version: owned(v),
            }),
            _ => Err(ApheleiaError::InvalidGav(value.to_string())),
        }
    }

    /// The `artifact:version` part used to build record names.
    #[must_use]
    pub fn artifact_and_version(&self) -> String {
        format!("{}.{}", self.artifact, self.version)
    }
}

impl fmt::Display for Gav {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.artifact)?;
        if let Some(ref packaging) = self.packaging {
            write!(f, ":{packaging}")?;
        }
        if let Some(ref classifier) = self.classifier {
            write!(f, ":{classifier}")?;
        }
        write!(f, ":{}", self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_part() {
        let gav = Gav::parse("org.apache.commons:commons-lang3:3.12.0").unwrap();
        assert_eq!(gav.group, "org.apache.commons");
        assert_eq!(gav.artifact, "commons-lang3");
        assert_eq!(gav.version, "3.12.0");
        assert_eq!(gav.to_string(), "org.apache.commons:commons-lang3:3.12.0");
    }

    #[test]
    fn test_parse_with_classifier() {
        let gav = Gav::parse("io.netty:netty-transport-native-epoll:jar:linux-x86_64:4.1.86.Final").unwrap();
        assert_eq!(gav.packaging.as_deref(), Some("jar"));
        assert_eq!(gav.classifier.as_deref(), Some("linux-x86_64"));
        assert_eq!(gav.version, "4.1.86.Final");
        assert_eq!(
            gav.to_string(),
            "io.netty:netty-transport-native-epoll:jar:linux-x86_64:4.1.86.Final"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Gav::parse("just-a-name").is_err());
        assert!(Gav::parse("g::1.0").is_err());
        assert!(Gav::parse("g:a:b:c:d:e").is_err());
        assert!(Gav::parse("g:a b:1.0").is_err());
    }
}
