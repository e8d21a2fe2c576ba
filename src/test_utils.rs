//! Shared test fixtures.
//!
//! Throwaway git repositories for the clone and executor tests, plus the
//! push descriptor most tests start from. Host and user git config are
//! masked out of every git invocation so fixtures behave the same on any
//! machine.

use std::path::Path;

use crate::types::{
    BuildDescriptor, BuildNumber, ProjectId, RepoName, RequestId, Sha, TriggerKind,
};

/// Runs a git command in `dir`, panicking on failure.
pub fn git_in(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn head_sha(dir: &Path) -> Sha {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    Sha::parse(String::from_utf8_lossy(&output.stdout).trim()).unwrap()
}

/// Creates an empty repository with a committer identity, ready for
/// [`commit_file`].
pub fn init_source_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git_in(dir, &["init"]);
    git_in(dir, &["config", "user.email", "test@test.com"]);
    git_in(dir, &["config", "user.name", "Test"]);
}

/// Writes and commits one file, returning the new head.
pub fn commit_file(dir: &Path, name: &str, contents: &str) -> Sha {
    std::fs::write(dir.join(name), contents).unwrap();
    git_in(dir, &["add", "."]);
    git_in(dir, &["commit", "-m", name]);
    head_sha(dir)
}

/// A public master push for `octocat/hello`. Tests mutate the fields they
/// care about.
pub fn push_descriptor(commit: &Sha, request_id: &str) -> BuildDescriptor {
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
        commit: commit.clone(),
        base_commit: None,
        comment: String::new(),
        user: "octocat".to_string(),
        committers: None,
        request_id: RequestId::new(request_id),
        is_rebuild: false,
    }
}
