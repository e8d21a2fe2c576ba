//! Build descriptor and record types.
//!
//! A [`BuildDescriptor`] identifies one build request as normalized from an
//! inbound event; a [`BuildRecord`] is the persisted row in the build store.
//! Records use camelCase keys, which is the store's schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use super::ids::{BuildNumber, ProjectId, RepoName, RequestId, Sha};

/// What kind of event triggered a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
}

impl TriggerKind {
    pub fn is_pull_request(&self) -> bool {
        matches!(self, TriggerKind::PullRequest)
    }
}

/// The lifecycle status of a build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Record created, build not yet finished (or delegated to a container).
    Pending,
    Success,
    Failure,
}

impl BuildStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, BuildStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reconstructing a descriptor from a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("project {0} is not a gh/ project")]
    ForeignProject(ProjectId),

    #[error("unrecognized trigger label: {0}")]
    BadTrigger(String),
}

/// One normalized build request.
///
/// Produced by the event parser (or reconstructed from a stored record for
/// rebuilds); owned by exactly one executor invocation. `build_num` stays
/// zero until the store assigns a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDescriptor {
    pub project: ProjectId,

    #[serde(default)]
    pub build_num: BuildNumber,

    pub event_type: TriggerKind,

    /// Pull request number; `None` for pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_num: Option<u64>,

    /// The repository the event was reported against.
    pub repo: RepoName,

    pub is_private: bool,

    /// Base branch for PRs, pushed branch for pushes.
    pub branch: String,

    /// The repository to clone from. Differs from `repo` for fork PRs.
    pub clone_repo: RepoName,

    /// Branch to pass to the clone; the commit is checked out on top of it.
    pub checkout_branch: String,

    pub commit: Sha,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<Sha>,

    /// PR title or head commit message.
    #[serde(default)]
    pub comment: String,

    /// PR author or pusher login.
    #[serde(default)]
    pub user: String,

    /// Distinct committer logins seen in a push. `None` for PRs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committers: Option<HashSet<String>>,

    pub request_id: RequestId,

    /// True when re-running a previously persisted build. Rebuilds fetch
    /// full history so the original commit is reachable.
    #[serde(default)]
    pub is_rebuild: bool,
}

impl BuildDescriptor {
    /// A fork build clones from somewhere other than the reported repo.
    pub fn is_fork(&self) -> bool {
        self.clone_repo != self.repo
    }

    /// The trigger label persisted with the record: `pr/<n>` or `push/<branch>`.
    pub fn trigger_label(&self) -> String {
        match self.pr_num {
            Some(n) => format!("pr/{n}"),
            None => format!("push/{}", self.branch),
        }
    }

    /// Reconstructs a descriptor from a stored record, for rebuilds and
    /// deferred status updates. The clone repo is taken from the record; the
    /// reported repo comes back out of the project key.
    pub fn from_record(
        record: &BuildRecord,
        request_id: RequestId,
        is_rebuild: bool,
    ) -> Result<Self, RecordError> {
        let repo = record
            .project
            .repo_name()
            .ok_or_else(|| RecordError::ForeignProject(record.project.clone()))?;
        let (event_type, pr_num) = parse_trigger_label(&record.trigger)
            .ok_or_else(|| RecordError::BadTrigger(record.trigger.clone()))?;
        Ok(BuildDescriptor {
            project: record.project.clone(),
            build_num: BuildNumber(0),
            event_type,
            pr_num,
            repo,
            is_private: record.is_private,
            branch: record.branch.clone(),
            clone_repo: record.clone_repo.clone(),
            checkout_branch: record.checkout_branch.clone(),
            commit: record.commit.clone(),
            base_commit: record.base_commit.clone(),
            comment: record.comment.clone(),
            user: record.user.clone(),
            committers: record.committers.clone(),
            request_id,
            is_rebuild,
        })
    }
}

fn parse_trigger_label(label: &str) -> Option<(TriggerKind, Option<u64>)> {
    if let Some(n) = label.strip_prefix("pr/") {
        let n: u64 = n.parse().ok()?;
        Some((TriggerKind::PullRequest, Some(n)))
    } else {
        label
            .strip_prefix("push/")
            .map(|_| (TriggerKind::Push, None))
    }
}

/// The persisted build row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub project: ProjectId,
    pub build_num: BuildNumber,
    pub request_id: RequestId,
    pub trigger: String,
    pub status: BuildStatus,
    pub branch: String,
    pub commit: Sha,
    pub clone_repo: RepoName,
    pub checkout_branch: String,
    pub is_private: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<Sha>,

    #[serde(default)]
    pub comment: String,

    #[serde(default)]
    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committers: Option<HashSet<String>>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// Opens a pending record for a descriptor whose build number has just
    /// been assigned.
    pub fn open(descriptor: &BuildDescriptor) -> Self {
        BuildRecord {
            project: descriptor.project.clone(),
            build_num: descriptor.build_num,
            request_id: descriptor.request_id.clone(),
            trigger: descriptor.trigger_label(),
            status: BuildStatus::Pending,
            branch: descriptor.branch.clone(),
            commit: descriptor.commit.clone(),
            clone_repo: descriptor.clone_repo.clone(),
            checkout_branch: descriptor.checkout_branch.clone(),
            is_private: descriptor.is_private,
            base_commit: descriptor.base_commit.clone(),
            comment: descriptor.comment.clone(),
            user: descriptor.user.clone(),
            committers: descriptor.committers.clone(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_descriptor() -> BuildDescriptor {
        BuildDescriptor {
            project: ProjectId::new("gh/octocat/hello"),
            build_num: BuildNumber(0),
            event_type: TriggerKind::Push,
            pr_num: None,
            repo: RepoName::parse("octocat/hello").unwrap(),
            is_private: false,
            branch: "master".to_string(),
            clone_repo: RepoName::parse("octocat/hello").unwrap(),
            checkout_branch: "master".to_string(),
            commit: Sha::parse("abc123def4567890abc123def4567890abc123de").unwrap(),
            base_commit: Sha::parse("1111111111111111111111111111111111111111").ok(),
            comment: "Fix the frobnicator".to_string(),
            user: "octocat".to_string(),
            committers: Some(["octocat".to_string()].into_iter().collect()),
            request_id: RequestId::new("req-1"),
            is_rebuild: false,
        }
    }

    mod trigger_labels {
        use super::*;

        #[test]
        fn push_label_carries_branch() {
            let descriptor = sample_descriptor();
            assert_eq!(descriptor.trigger_label(), "push/master");
        }

        #[test]
        fn pr_label_carries_number() {
            let mut descriptor = sample_descriptor();
            descriptor.event_type = TriggerKind::PullRequest;
            descriptor.pr_num = Some(42);
            assert_eq!(descriptor.trigger_label(), "pr/42");
        }

        proptest! {
            #[test]
            fn pr_label_roundtrips(n: u64) {
                let label = format!("pr/{n}");
                prop_assert_eq!(
                    parse_trigger_label(&label),
                    Some((TriggerKind::PullRequest, Some(n)))
                );
            }

            #[test]
            fn push_label_roundtrips(branch in "[a-zA-Z0-9/._-]{1,40}") {
                let label = format!("push/{branch}");
                prop_assert_eq!(parse_trigger_label(&label), Some((TriggerKind::Push, None)));
            }
        }

        #[test]
        fn garbage_labels_rejected() {
            assert_eq!(parse_trigger_label("cron/nightly"), None);
            assert_eq!(parse_trigger_label("pr/not-a-number"), None);
            assert_eq!(parse_trigger_label(""), None);
        }
    }

    mod fork_detection {
        use super::*;

        #[test]
        fn same_repo_is_not_fork() {
            assert!(!sample_descriptor().is_fork());
        }

        #[test]
        fn different_clone_repo_is_fork() {
            let mut descriptor = sample_descriptor();
            descriptor.clone_repo = RepoName::parse("someone-else/hello").unwrap();
            assert!(descriptor.is_fork());
        }
    }

    mod records {
        use super::*;

        #[test]
        fn open_starts_pending() {
            let mut descriptor = sample_descriptor();
            descriptor.build_num = BuildNumber(7);
            let record = BuildRecord::open(&descriptor);
            assert_eq!(record.status, BuildStatus::Pending);
            assert_eq!(record.build_num, BuildNumber(7));
            assert_eq!(record.trigger, "push/master");
            assert!(record.ended_at.is_none());
        }

        #[test]
        fn record_serializes_with_camel_case_keys() {
            let mut descriptor = sample_descriptor();
            descriptor.build_num = BuildNumber(3);
            let json = serde_json::to_value(BuildRecord::open(&descriptor)).unwrap();
            assert!(json.get("buildNum").is_some());
            assert!(json.get("requestId").is_some());
            assert!(json.get("startedAt").is_some());
            assert!(json.get("checkoutBranch").is_some());
            assert_eq!(json["status"], "pending");
        }

        #[test]
        fn from_record_roundtrips_descriptor_identity() {
            let mut descriptor = sample_descriptor();
            descriptor.build_num = BuildNumber(12);
            let record = BuildRecord::open(&descriptor);
            let rebuilt =
                BuildDescriptor::from_record(&record, RequestId::new("req-2"), true).unwrap();

            assert_eq!(rebuilt.project, descriptor.project);
            assert_eq!(rebuilt.repo, descriptor.repo);
            assert_eq!(rebuilt.commit, descriptor.commit);
            assert_eq!(rebuilt.event_type, TriggerKind::Push);
            assert_eq!(rebuilt.pr_num, None);
            // A fresh number is assigned later; reconstruction never reuses one.
            assert_eq!(rebuilt.build_num, BuildNumber(0));
            assert!(rebuilt.is_rebuild);
            assert_eq!(rebuilt.request_id, RequestId::new("req-2"));
        }

        #[test]
        fn from_record_rejects_foreign_project() {
            let mut descriptor = sample_descriptor();
            descriptor.build_num = BuildNumber(1);
            let mut record = BuildRecord::open(&descriptor);
            record.project = ProjectId::new("svn/legacy");
            let err =
                BuildDescriptor::from_record(&record, RequestId::new("r"), false).unwrap_err();
            assert!(matches!(err, RecordError::ForeignProject(_)));
        }
    }

    mod status {
        use super::*;

        #[test]
        fn serde_uses_snake_case_words() {
            assert_eq!(
                serde_json::to_string(&BuildStatus::Pending).unwrap(),
                "\"pending\""
            );
            assert_eq!(
                serde_json::to_string(&TriggerKind::PullRequest).unwrap(),
                "\"pull_request\""
            );
        }

        #[test]
        fn pending_predicate() {
            assert!(BuildStatus::Pending.is_pending());
            assert!(!BuildStatus::Success.is_pending());
            assert!(!BuildStatus::Failure.is_pending());
        }
    }
}
