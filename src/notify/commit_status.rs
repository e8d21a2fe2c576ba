//! Commit-status sink.
//!
//! Posts `pending`/`success`/`failure` states against the build's commit.
//! One notifier is scoped to one build: repo, commit, and build number are
//! fixed at construction, after the build number has been assigned.

use async_trait::async_trait;
use reqwest::{header, StatusCode};

use crate::types::{BuildDescriptor, BuildNumber, RepoName, Sha};

use super::{Deliver, NotifyError, StatusUpdate};

pub struct CommitStatusNotifier {
    http: reqwest::Client,
    api_url: String,
    token: String,
    user_agent: String,
    /// Status context, `continuous-integration/<stack>`.
    context: String,
    repo: RepoName,
    commit: Sha,
    build_num: BuildNumber,
    log_url: String,
}

impl CommitStatusNotifier {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        stack: &str,
        context: impl Into<String>,
        descriptor: &BuildDescriptor,
        log_url: impl Into<String>,
    ) -> Self {
        CommitStatusNotifier {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            token: token.into(),
            user_agent: stack.to_string(),
            context: context.into(),
            repo: descriptor.repo.clone(),
            commit: descriptor.commit.clone(),
            build_num: descriptor.build_num,
            log_url: log_url.into(),
        }
    }

    async fn post_status(&self, state: &str, description: &str) -> Result<(), NotifyError> {
        let url = format!(
            "{}/repos/{}/statuses/{}",
            self.api_url, self.repo, self.commit
        );
        let body = serde_json::json!({
            "state": state,
            "description": description,
            "target_url": self.log_url,
            "context": self.context,
        });

        let response = self
            .http
            .post(&url)
            .header(header::ACCEPT, "application/vnd.github.v3+json")
            .header(header::USER_AGENT, &self.user_agent)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(NotifyError::BadToken),
            StatusCode::NOT_FOUND => Err(NotifyError::MissingPrivileges),
            status if status.is_success() => Ok(()),
            status => {
                let message = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("message")?.as_str().map(String::from))
                    .unwrap_or_else(|| status.to_string());
                Err(NotifyError::Api { status, message })
            }
        }
    }
}

#[async_trait]
impl Deliver for CommitStatusNotifier {
    fn name(&self) -> &'static str {
        "commit-status"
    }

    async fn deliver(&mut self, update: StatusUpdate) -> Result<(), NotifyError> {
        let (state, description) = match &update {
            StatusUpdate::Started => (
                "pending",
                format!("Build #{} started...", self.build_num.0),
            ),
            StatusUpdate::Finished(build) if build.succeeded() => (
                "success",
                format!("Build #{} successful!", self.build_num.0),
            ),
            StatusUpdate::Finished(build) => (
                "failure",
                build
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Build #{} failed", self.build_num.0)),
            ),
        };
        self.post_status(state, &description).await
    }
}
