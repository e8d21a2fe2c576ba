//! GitHub event normalization.
//!
//! This module turns a raw push or pull-request payload into a
//! [`BuildDescriptor`], or into an ignore outcome for deliveries that are
//! structurally fine but should not build (closed PRs, deleted branches,
//! uninteresting actions).
//!
//! # Parsing policy
//!
//! 1. The payload is trimmed of url-shaped keys first (see [`super::trim`])
//! 2. The event type comes from the `X-GitHub-Event` hint when present, and
//!    is otherwise inferred from payload shape (`pull_request` key vs
//!    `pusher` key)
//! 3. Ignorable deliveries are values, not errors; structural problems
//!    (missing fields, invalid names, a PR whose base repo is not the event
//!    repo) are hard errors

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

use crate::events::trim::trim_url_keys;
use crate::types::{
    BuildDescriptor, BuildNumber, InvalidRepoName, InvalidSha, ProjectId, RepoName, RequestId,
    Sha, TriggerKind,
};

static REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^refs/(heads|tags)/(.+)$").unwrap());

/// Error type for event parsing failures.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Could not parse webhook body as JSON")]
    BodyNotJson,

    #[error("Unknown GitHub event type: {0}")]
    UnknownEventType(String),

    #[error("repository field is missing from GitHub event")]
    MissingRepository,

    #[error("pull_request field is missing from GitHub event")]
    MissingPullRequest,

    #[error("head_commit field is missing from GitHub event")]
    MissingHeadCommit,

    #[error("base repo {base} is different from event repo {repo}")]
    BaseRepoMismatch { base: String, repo: String },

    #[error(transparent)]
    InvalidRepo(#[from] InvalidRepoName),

    #[error(transparent)]
    InvalidCommit(#[from] InvalidSha),

    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The result of parsing a structurally valid delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Build(BuildDescriptor),
    /// Delivery acknowledged but not built, with the reason.
    Ignore(String),
}

impl ParseOutcome {
    pub fn ignore_reason(&self) -> Option<&str> {
        match self {
            ParseOutcome::Ignore(reason) => Some(reason),
            ParseOutcome::Build(_) => None,
        }
    }
}

/// Parses a provider event into a build descriptor or an ignore outcome.
///
/// `event_type` is the transport's event-type hint (the `X-GitHub-Event`
/// header, or the equivalent notification attribute); `request_id` is the
/// idempotency token the resulting build runs under.
pub fn parse_event(
    mut payload: Value,
    event_type: Option<&str>,
    request_id: RequestId,
) -> Result<ParseOutcome, ParseError> {
    trim_url_keys(&mut payload);
    tracing::debug!(payload = %payload, "parsing event");

    let raw: RawEvent = serde_json::from_value(payload)?;

    let kind = match event_type {
        Some("pull_request") => TriggerKind::PullRequest,
        Some("push") => TriggerKind::Push,
        Some(other) => return Err(ParseError::UnknownEventType(other.to_string())),
        None if raw.pull_request.is_some() => TriggerKind::PullRequest,
        None if raw.pusher.is_some() => TriggerKind::Push,
        None => return Err(ParseError::UnknownEventType("unrecognized payload".to_string())),
    };

    let repository = raw.repository.as_ref().ok_or(ParseError::MissingRepository)?;
    let repo = RepoName::parse(&repository.full_name)?;
    let is_private = repository.private;

    match kind {
        TriggerKind::PullRequest => parse_pull_request(&raw, repo, is_private, request_id),
        TriggerKind::Push => parse_push(&raw, repo, is_private, request_id),
    }
}

// ============================================================================
// Raw payload structure
//
// One permissive structure covers both event shapes; required fields are
// validated explicitly so ignore checks can run before validation.
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawEvent {
    repository: Option<RawRepository>,
    action: Option<String>,
    pull_request: Option<RawPullRequest>,
    pusher: Option<RawPusher>,
    #[serde(rename = "ref")]
    ref_name: Option<String>,
    #[serde(default)]
    deleted: bool,
    before: Option<String>,
    head_commit: Option<RawCommit>,
    #[serde(default)]
    commits: Vec<RawCommit>,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    full_name: String,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    state: Option<String>,
    title: Option<String>,
    user: Option<RawUser>,
    head: RawPrRef,
    base: RawPrRef,
}

#[derive(Debug, Deserialize)]
struct RawPrRef {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
    repo: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawPusher {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    id: Option<String>,
    message: Option<String>,
    author: Option<RawIdentity>,
    committer: Option<RawIdentity>,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    username: Option<String>,
}

// ============================================================================
// pull_request events
// ============================================================================

const BUILDABLE_PR_ACTIONS: [&str; 3] = ["opened", "reopened", "synchronize"];

fn parse_pull_request(
    raw: &RawEvent,
    repo: RepoName,
    is_private: bool,
    request_id: RequestId,
) -> Result<ParseOutcome, ParseError> {
    let pr = raw.pull_request.as_ref().ok_or(ParseError::MissingPullRequest)?;

    if pr.state.as_deref() == Some("closed") {
        return Ok(ParseOutcome::Ignore(format!(
            "Pull request #{} is closed",
            pr.number
        )));
    }
    let action = raw.action.as_deref().unwrap_or("");
    if !BUILDABLE_PR_ACTIONS.contains(&action) {
        return Ok(ParseOutcome::Ignore(format!(
            "Ignoring pull request #{} action \"{}\"",
            pr.number, action
        )));
    }

    if pr.base.repo.full_name != repo.as_str() {
        return Err(ParseError::BaseRepoMismatch {
            base: pr.base.repo.full_name.clone(),
            repo: repo.as_str().to_string(),
        });
    }

    let clone_repo = RepoName::parse(&pr.head.repo.full_name)?;
    let commit = Sha::parse(&pr.head.sha)?;
    let branch = strip_heads(&pr.base.ref_name);
    let checkout_branch = strip_heads(&pr.head.ref_name);

    Ok(ParseOutcome::Build(BuildDescriptor {
        project: ProjectId::for_repo(&repo),
        build_num: BuildNumber(0),
        event_type: TriggerKind::PullRequest,
        pr_num: Some(pr.number),
        repo,
        is_private,
        branch,
        clone_repo,
        checkout_branch,
        commit,
        base_commit: Sha::parse(&pr.base.sha).ok(),
        comment: pr.title.clone().unwrap_or_default(),
        user: pr.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
        committers: None,
        request_id,
        is_rebuild: false,
    }))
}

// ============================================================================
// push events
// ============================================================================

fn parse_push(
    raw: &RawEvent,
    repo: RepoName,
    is_private: bool,
    request_id: RequestId,
) -> Result<ParseOutcome, ParseError> {
    let ref_name = raw.ref_name.as_deref().unwrap_or("");
    let Some(captures) = REF_RE.captures(ref_name) else {
        return Ok(ParseOutcome::Ignore(format!(
            "Ref does not match any branches: {ref_name}"
        )));
    };
    let branch = captures[2].to_string();

    if raw.deleted {
        return Ok(ParseOutcome::Ignore(format!("Branch {branch} was deleted")));
    }

    let head_commit = raw.head_commit.as_ref().ok_or(ParseError::MissingHeadCommit)?;
    let commit_id = head_commit.id.as_deref().ok_or(ParseError::MissingHeadCommit)?;
    let commit = Sha::parse(commit_id)?;

    let mut committers = HashSet::new();
    for entry in raw.commits.iter().chain([head_commit]) {
        for identity in [&entry.author, &entry.committer].into_iter().flatten() {
            if let Some(username) = &identity.username {
                committers.insert(username.clone());
            }
        }
    }

    Ok(ParseOutcome::Build(BuildDescriptor {
        project: ProjectId::for_repo(&repo),
        build_num: BuildNumber(0),
        event_type: TriggerKind::Push,
        pr_num: None,
        clone_repo: repo.clone(),
        repo,
        is_private,
        checkout_branch: branch.clone(),
        branch,
        commit,
        base_commit: raw.before.as_deref().and_then(|sha| Sha::parse(sha).ok()),
        comment: head_commit.message.clone().unwrap_or_default(),
        user: raw.pusher.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
        committers: Some(committers),
        request_id,
        is_rebuild: false,
    }))
}

fn strip_heads(ref_name: &str) -> String {
    ref_name
        .strip_prefix("refs/heads/")
        .unwrap_or(ref_name)
        .to_string()
}
