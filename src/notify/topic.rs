//! Topic sink: a fire-and-forget publish once a build finishes.
//!
//! Downstream subscribers (mail bridges, dashboards) filter on the `status`
//! attribute. There is no start message; the sink is registered as a finish
//! task only.

use async_trait::async_trait;

use crate::types::{BuildDescriptor, BuildNumber, RepoName, Sha};

use super::{Deliver, NotifyError, StatusUpdate};

pub struct TopicNotifier {
    http: reqwest::Client,
    url: String,
    repo: RepoName,
    branch: String,
    pr_num: Option<u64>,
    commit: Sha,
    build_num: BuildNumber,
    log_url: String,
}

impl TopicNotifier {
    pub fn new(url: impl Into<String>, descriptor: &BuildDescriptor, log_url: impl Into<String>) -> Self {
        TopicNotifier {
            http: reqwest::Client::new(),
            url: url.into(),
            repo: descriptor.repo.clone(),
            branch: descriptor.branch.clone(),
            pr_num: descriptor.pr_num,
            commit: descriptor.commit.clone(),
            build_num: descriptor.build_num,
            log_url: log_url.into(),
        }
    }
}

#[async_trait]
impl Deliver for TopicNotifier {
    fn name(&self) -> &'static str {
        "topic"
    }

    async fn deliver(&mut self, update: StatusUpdate) -> Result<(), NotifyError> {
        let StatusUpdate::Finished(build) = &update else {
            return Ok(());
        };

        let n = self.build_num.0;
        let subject = if build.succeeded() {
            format!("Boxcar Build #{n} successful!")
        } else {
            format!("Boxcar Build #{n} failed")
        };

        let ref_line = match self.pr_num {
            Some(pr) => format!("Pull Request: {pr}"),
            None => format!("Branch: {}", self.branch),
        };
        let mut message = format!(
            "Boxcar Build #{n}\nRepo: {}\n{ref_line}\nCommit: {}\nLog: {}\n",
            self.repo, self.commit, self.log_url
        );
        if let Some(error) = &build.error {
            message.push_str(&format!("Error: {error}"));
            if !build.log_tail.is_empty() {
                message.push('\n');
                message.push_str(&build.log_tail);
            }
        }

        let body = serde_json::json!({
            "subject": subject,
            "message": message,
            "attributes": {"status": build.status.as_str()},
        });
        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(NotifyError::Api { status, message });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::FinishedBuild;
    use crate::types::{BuildStatus, ProjectId, RequestId, TriggerKind};
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    fn descriptor() -> BuildDescriptor {
        BuildDescriptor {
            project: ProjectId::new("gh/octocat/hello"),
            build_num: BuildNumber(4),
            event_type: TriggerKind::Push,
            pr_num: None,
            repo: RepoName::parse("octocat/hello").unwrap(),
            is_private: false,
            branch: "master".to_string(),
            clone_repo: RepoName::parse("octocat/hello").unwrap(),
            checkout_branch: "master".to_string(),
            commit: Sha::parse("abc123").unwrap(),
            base_commit: None,
            comment: String::new(),
            user: "octocat".to_string(),
            committers: None,
            request_id: RequestId::new("req-1"),
            is_rebuild: false,
        }
    }

    async fn topic_server(published: Arc<Mutex<Vec<Value>>>) -> String {
        async fn record(
            State(published): State<Arc<Mutex<Vec<Value>>>>,
            Json(body): Json<Value>,
        ) -> &'static str {
            published.lock().unwrap().push(body);
            "ok"
        }

        let app = Router::new().route("/", post(record)).with_state(published);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn success_publishes_subject_body_and_status() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let url = topic_server(Arc::clone(&published)).await;
        let mut notifier = TopicNotifier::new(&url, &descriptor(), "http://logs.example/4");

        let build = FinishedBuild {
            descriptor: descriptor(),
            status: BuildStatus::Success,
            ended_at: Utc::now(),
            error: None,
            log_tail: String::new(),
        };
        notifier.deliver(StatusUpdate::Finished(build)).await.unwrap();

        let published = published.lock().unwrap();
        assert_eq!(published[0]["subject"], "Boxcar Build #4 successful!");
        assert_eq!(published[0]["attributes"]["status"], "success");
        let message = published[0]["message"].as_str().unwrap();
        assert!(message.contains("Repo: octocat/hello"));
        assert!(message.contains("Branch: master"));
        assert!(message.contains("Commit: abc123"));
        assert!(message.contains("Log: http://logs.example/4"));
        assert!(!message.contains("Error:"));
    }

    #[tokio::test]
    async fn failure_appends_the_error_and_log_tail() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let url = topic_server(Arc::clone(&published)).await;
        let mut notifier = TopicNotifier::new(&url, &descriptor(), "http://logs.example/4");

        let build = FinishedBuild {
            descriptor: descriptor(),
            status: BuildStatus::Failure,
            ended_at: Utc::now(),
            error: Some("Command \"make\" failed with code 2".to_string()),
            log_tail: "make: *** [all] Error 2".to_string(),
        };
        notifier.deliver(StatusUpdate::Finished(build)).await.unwrap();

        let published = published.lock().unwrap();
        assert_eq!(published[0]["subject"], "Boxcar Build #4 failed");
        assert_eq!(published[0]["attributes"]["status"], "failure");
        let message = published[0]["message"].as_str().unwrap();
        assert!(message.ends_with(
            "Error: Command \"make\" failed with code 2\nmake: *** [all] Error 2"
        ));
    }

    #[tokio::test]
    async fn start_updates_are_ignored() {
        // No server: a request would fail, so Ok proves nothing was sent
        let mut notifier =
            TopicNotifier::new("http://127.0.0.1:9/", &descriptor(), "http://logs.example/4");
        notifier.deliver(StatusUpdate::Started).await.unwrap();
    }
}
