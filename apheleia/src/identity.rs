//! Deterministic record identities.
//!
//! Everything here is a pure function of its inputs. Concurrent discovery of
//! the same repository coordinates must converge on one `DependencyBuild`, so
//! the id is derived from the coordinates alone and used as the store key;
//! the store's create-if-absent semantics then do the deduplication.

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::core::CONTAMINATED_BY_ANNOTATION_PREFIX;

/// Maximum length of a record name.
pub const MAX_NAME_LENGTH: usize = 63;

const HASH_SUFFIX_LENGTH: usize = 8;

/// Computes the id of the `DependencyBuild` for a repository checkout.
///
/// The id is the lowercase hex MD5 of `scm_url + tag + path`, which is always
/// 32 name-safe characters.
#[must_use]
pub fn dependency_build_id(scm_url: &str, tag: &str, path: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(scm_url.as_bytes());
    hasher.update(tag.as_bytes());
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Computes the name of the `ArtifactBuild` for a GAV.
///
/// The readable part is the GAV minus its group, lowercased and restricted to
/// `[a-z0-9.-]`; a short SHA-256 suffix keeps GAVs that sanitise to the same
/// text apart.
#[must_use]
pub fn artifact_build_name(gav: &str) -> String {
    let readable = gav.split_once(':').map_or(gav, |(_, rest)| rest);
    let mut base: String = readable
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '-') => c,
            ':' => '.',
            _ => '-',
        })
        .collect();

    base.truncate(MAX_NAME_LENGTH - HASH_SUFFIX_LENGTH - 1);
    let base = base.trim_matches(|c: char| !c.is_ascii_alphanumeric());

    let suffix = short_hash(gav);
    if base.is_empty() {
        suffix
    } else {
        format!("{base}-{suffix}")
    }
}

/// Builds the `contaminated-by` annotation key for a `DependencyBuild`.
///
/// The suffix is a hash of the build's name so one `ArtifactBuild` can carry
/// links to several builds at once.
#[must_use]
pub fn contaminated_by_annotation(dependency_build: &str) -> String {
    format!(
        "{CONTAMINATED_BY_ANNOTATION_PREFIX}{}",
        short_hash(dependency_build)
    )
}

/// First eight hex characters of the SHA-256 of `value`.
#[must_use]
pub fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..HASH_SUFFIX_LENGTH / 2])
}
