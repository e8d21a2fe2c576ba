//! Repository acquisition.
//!
//! Each build gets a single-use clone under the stack's build directory,
//! which is wiped before every clone. Private repositories clone through a
//! tokenized remote URL; when secret inheritance is off, the token stays
//! out of `.git/config` by fetching into a fresh `git init` instead of
//! cloning. Logged commands and captured output always mask the token.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;

use crate::config::EffectiveConfig;
use crate::runner::BuildLog;
use crate::types::{BuildDescriptor, RepoName, Sha};

const GITHUB_REMOTE: &str = "https://github.com";

/// Errors acquiring a repository. The displayed text is what notifiers
/// show as the build's failure message.
#[derive(Debug, Error)]
pub enum CloneError {
    /// Path-traversal guard: repo names feed directly into the clone path.
    #[error("Clone directory {} escapes the build directory {}", dir.display(), base.display())]
    OutsideBaseDir { dir: PathBuf, base: PathBuf },

    /// A leading dash would read as an option to git.
    #[error("Branch is invalid: {0}")]
    InvalidBranch(String),

    #[error("Repository not found or access denied: {repo}")]
    RepoNotFound { repo: RepoName },

    #[error("Branch or ref not found: {branch} in {repo}")]
    RefNotFound { repo: RepoName, branch: String },

    #[error("Commit not found: {commit} in {repo}")]
    CommitNotFound { repo: RepoName, commit: Sha },

    #[error("Command \"{command}\" failed with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how clones happen.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    /// Every clone lands under this directory, and it is recursively
    /// removed before each clone.
    pub base_build_dir: PathBuf,

    /// Remote prefix; clone URLs are `<remote_base>/<owner>/<name>.git`.
    pub remote_base: String,
}

impl CloneConfig {
    pub fn new(base_build_dir: impl Into<PathBuf>) -> Self {
        CloneConfig {
            base_build_dir: base_build_dir.into(),
            remote_base: GITHUB_REMOTE.to_string(),
        }
    }

    /// The single-use working directory for a build, keyed by the reported
    /// repository name.
    pub fn clone_dir(&self, repo: &RepoName) -> PathBuf {
        self.base_build_dir.join(repo.as_str())
    }

    /// Tokens ride the transient remote URL, never a config file.
    fn clone_url(&self, repo: &RepoName, token: Option<&str>) -> String {
        let url = format!("{}/{}.git", self.remote_base, repo);
        if let Some(token) = token {
            if let Some(rest) = url.strip_prefix("https://") {
                return format!("https://{token}@{rest}");
            }
        }
        url
    }
}

/// Acquires the descriptor's commit into a fresh working directory and
/// returns its path.
///
/// Clone depth is shallow unless the descriptor is a rebuild, which fetches
/// full history so the original commit is still reachable. Failure text is
/// mapped to the friendly repo/ref/commit-not-found forms where git's
/// output allows it.
pub async fn clone(
    config: &CloneConfig,
    descriptor: &BuildDescriptor,
    build_config: &EffectiveConfig,
    log: &BuildLog,
) -> Result<PathBuf, CloneError> {
    let repo = &descriptor.clone_repo;
    let branch = descriptor.checkout_branch.as_str();

    if branch.starts_with('-') {
        return Err(CloneError::InvalidBranch(branch.to_string()));
    }

    let base = lexical_normalized(&config.base_build_dir);
    let dir = lexical_normalized(&config.clone_dir(&descriptor.repo));
    if dir == base || !dir.starts_with(&base) {
        return Err(CloneError::OutsideBaseDir { dir, base });
    }

    // Single-use working directory: wipe whatever the previous build left.
    match tokio::fs::remove_dir_all(&base).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    let token = if descriptor.is_private {
        build_config.github_token()
    } else {
        None
    };
    let url = config.clone_url(repo, token);
    let depth = (!descriptor.is_rebuild).then_some(build_config.git.depth);

    if token.is_some() && !build_config.inherit_secrets {
        // The token must stay off disk: fetch into a fresh repository so no
        // remote URL lands in .git/config.
        tokio::fs::create_dir_all(&dir).await?;
        run_git(Some(&dir), &["init"], token, log)
            .await
            .map_err(GitFailure::into_error)?;

        let mut fetch = vec!["fetch".to_string()];
        if let Some(depth) = depth {
            fetch.push("--depth".to_string());
            fetch.push(depth.to_string());
        }
        fetch.push(url);
        fetch.push(branch.to_string());
        run_git(Some(&dir), &fetch, token, log)
            .await
            .map_err(|failure| failure.for_remote(repo, branch))?;

        run_git(Some(&dir), &["checkout", "-qf", "FETCH_HEAD"], token, log)
            .await
            .map_err(GitFailure::into_error)?;
    } else {
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut args = vec!["clone".to_string()];
        if let Some(depth) = depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }
        args.push(url);
        args.push("-b".to_string());
        args.push(branch.to_string());
        args.push(dir.to_string_lossy().into_owned());
        run_git(None, &args, token, log)
            .await
            .map_err(|failure| failure.for_remote(repo, branch))?;
    }

    let checkout = ["checkout", "-qf", descriptor.commit.as_str()];
    run_git(Some(&dir), &checkout, token, log)
        .await
        .map_err(|failure| failure.for_checkout(repo, &descriptor.commit))?;

    Ok(dir)
}

/// Lexical path normalization: folds `.` and `..` without touching the
/// filesystem, since the target does not exist when the guard runs.
fn lexical_normalized(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn masked(text: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() => text.replace(token, "XXXX"),
        _ => text.to_string(),
    }
}

/// A git subprocess that did not complete cleanly, before mapping to the
/// step-specific [`CloneError`].
enum GitFailure {
    Spawn(std::io::Error),
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl GitFailure {
    fn into_error(self) -> CloneError {
        match self {
            GitFailure::Spawn(error) => CloneError::Io(error),
            GitFailure::Exit { command, code, .. } => CloneError::CommandFailed { command, code },
        }
    }

    /// Friendly mapping for clone/fetch failures, keyed off git's stderr.
    fn for_remote(self, repo: &RepoName, branch: &str) -> CloneError {
        if let GitFailure::Exit { stderr, .. } = &self {
            if stderr.contains("couldn't find remote ref")
                || (stderr.contains("Remote branch") && stderr.contains("not found"))
            {
                return CloneError::RefNotFound {
                    repo: repo.clone(),
                    branch: branch.to_string(),
                };
            }
            if stderr.contains("not found")
                || stderr.contains("Authentication failed")
                || stderr.contains("could not read Username")
            {
                return CloneError::RepoNotFound { repo: repo.clone() };
            }
        }
        self.into_error()
    }

    /// A failed final checkout almost always means the commit is not in the
    /// fetched history.
    fn for_checkout(self, repo: &RepoName, commit: &Sha) -> CloneError {
        if let GitFailure::Exit { stderr, .. } = &self {
            if stderr.contains(commit.as_str())
                || stderr.contains("did not match any")
                || stderr.contains("is not a tree")
                || stderr.contains("bad object")
                || stderr.contains("unknown revision")
            {
                return CloneError::CommitNotFound {
                    repo: repo.clone(),
                    commit: commit.clone(),
                };
            }
        }
        self.into_error()
    }
}

/// Runs one git command with a scrubbed environment, pushing the masked
/// command line and its output into the build log.
async fn run_git<S: AsRef<str>>(
    workdir: Option<&Path>,
    args: &[S],
    token: Option<&str>,
    log: &BuildLog,
) -> Result<(), GitFailure> {
    let mut rendered = String::from("git");
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg.as_ref());
    }
    let command = masked(&rendered, token);
    log.push(format!("$ {command}"));
    tracing::debug!(command = %command, "running git");

    let mut git = tokio::process::Command::new("git");
    git.args(args.iter().map(AsRef::as_ref))
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null());
    if let Some(dir) = workdir {
        git.current_dir(dir);
    }

    let output = git.output().await.map_err(GitFailure::Spawn)?;

    let stdout = masked(&String::from_utf8_lossy(&output.stdout), token);
    let stderr = masked(&String::from_utf8_lossy(&output.stderr), token);
    for line in stdout.lines().chain(stderr.lines()) {
        log.push(line);
    }

    if output.status.success() {
        return Ok(());
    }
    let code = output.status.code().unwrap_or(-1);
    tracing::warn!(command = %command, code, stderr = %stderr.trim(), "git command failed");
    Err(GitFailure::Exit {
        command,
        code,
        stderr,
    })
}
