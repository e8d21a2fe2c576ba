//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! RequestId where a ProjectId is expected) and make the code more
//! self-documenting.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

static REPO_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$").unwrap());

static COMMIT_SHA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-f]+$").unwrap());

static ALL_ZEROS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^0+$").unwrap());

/// A project key in the build store, e.g. `gh/owner/name`.
///
/// The `gh/` prefix namespaces GitHub-sourced projects; the remainder is the
/// repository's full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(s: impl Into<String>) -> Self {
        ProjectId(s.into())
    }

    /// The project key for a GitHub repository.
    pub fn for_repo(repo: &RepoName) -> Self {
        ProjectId(format!("gh/{repo}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the repository name from a `gh/`-prefixed project key.
    pub fn repo_name(&self) -> Option<RepoName> {
        let rest = self.0.strip_prefix("gh/")?;
        RepoName::parse(rest).ok()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProjectId {
    fn from(s: String) -> Self {
        ProjectId(s)
    }
}

/// Error returned when a repository name fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Repository is invalid: {0}")]
pub struct InvalidRepoName(pub String);

/// A repository full name in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(String);

impl RepoName {
    /// Validates and wraps a repository full name.
    ///
    /// Both components may contain letters, digits, `-`, `_`, and `.`.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidRepoName> {
        let s = s.into();
        if REPO_NAME_RE.is_match(&s) {
            Ok(RepoName(s))
        } else {
            Err(InvalidRepoName(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a commit SHA fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Commit is invalid: {0}")]
pub struct InvalidSha(pub String);

/// A git commit SHA (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Validates and wraps a commit SHA.
    ///
    /// Accepts any nonempty lowercase hex string that is not all zeros (the
    /// all-zeros SHA marks a deleted ref, never a buildable commit).
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidSha> {
        let s = s.into();
        if COMMIT_SHA_RE.is_match(&s) && !ALL_ZEROS_RE.is_match(&s) {
            Ok(Sha(s))
        } else {
            Err(InvalidSha(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version of the SHA for display.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-project build number, assigned atomically by the build store.
///
/// Zero means "not yet assigned".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BuildNumber(pub u64);

impl BuildNumber {
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BuildNumber {
    fn from(n: u64) -> Self {
        BuildNumber(n)
    }
}

/// The idempotency token carried by the invoking transport.
///
/// Retried deliveries reuse the same id, which is how duplicate build
/// requests are absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(s: impl Into<String>) -> Self {
        RequestId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}
