//! Chat sink, shaped around the Slack web API.
//!
//! The first delivery posts a message; later deliveries for the same build
//! update that message in place via the `ts` handle the API returned. The
//! configured channel may be a public name like `#general`; the update
//! endpoint wants the channel id, so the id from the first response replaces
//! the name once known.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::config::ChatConfig;
use crate::types::{BuildDescriptor, BuildNumber, RepoName};

use super::{Deliver, NotifyError, StatusUpdate};

// From chalk/ansi-regex
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x1b\x9b][\[()#;?]*(?:[0-9]{1,4}(?:;[0-9]{0,4})*)?[0-9A-ORZcf-nqry=><]")
        .unwrap()
});

pub struct ChatNotifier {
    http: reqwest::Client,
    api_url: String,
    token: String,
    channel: String,
    username: String,
    as_user: bool,
    icon_url: Option<String>,
    repo: RepoName,
    branch: String,
    pr_num: Option<u64>,
    build_num: BuildNumber,
    log_url: String,
    /// Timestamp handle of the message posted for this build.
    last_ts: Option<String>,
}

impl ChatNotifier {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        config: &ChatConfig,
        descriptor: &BuildDescriptor,
        log_url: impl Into<String>,
    ) -> Self {
        ChatNotifier {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            token: token.into(),
            channel: config.channel.clone(),
            username: config.username.clone(),
            as_user: config.as_user,
            icon_url: config.icon_url.clone(),
            repo: descriptor.repo.clone(),
            branch: descriptor.branch.clone(),
            pr_num: descriptor.pr_num,
            build_num: descriptor.build_num,
            log_url: log_url.into(),
            last_ts: None,
        }
    }

    fn attachment(&self, color: &str, title: &str, text: Option<&str>) -> Value {
        let (ref_title, ref_value) = match self.pr_num {
            Some(n) => (
                "Pull Request",
                format!("<https://github.com/{}/pull/{n}|#{n}>", self.repo),
            ),
            None => (
                "Branch",
                format!(
                    "<https://github.com/{}/tree/{}|{}>",
                    self.repo, self.branch, self.branch
                ),
            ),
        };
        let mut attachment = serde_json::json!({
            "color": color,
            "title": title,
            "title_link": self.log_url,
            "fallback": title,
            "fields": [
                {
                    "title": "Repository",
                    "value": format!("<https://github.com/{0}|{0}>", self.repo),
                    "short": true,
                },
                {"title": ref_title, "value": ref_value, "short": true},
            ],
        });
        if let Some(text) = text {
            attachment["text"] = Value::String(text.to_string());
            attachment["mrkdwn_in"] = serde_json::json!(["text"]);
        }
        attachment
    }

    /// Sends the attachment, posting the first time and updating after.
    async fn post_or_update(&mut self, attachment: Value) -> Result<(), NotifyError> {
        let attachments = serde_json::json!([attachment]).to_string();
        let mut form: Vec<(&str, String)> = vec![
            ("token", self.token.clone()),
            ("channel", self.channel.clone()),
            ("username", self.username.clone()),
            ("as_user", self.as_user.to_string()),
            ("attachments", attachments),
        ];
        if let Some(icon_url) = &self.icon_url {
            form.push(("icon_url", icon_url.clone()));
        }

        let method = match &self.last_ts {
            Some(ts) => {
                form.push(("ts", ts.clone()));
                "chat.update"
            }
            None => "chat.postMessage",
        };

        let response = self
            .http
            .post(format!("{}/{}", self.api_url, method))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(NotifyError::Api { status, message });
        }

        let body: Value = response.json().await?;
        if body["ok"] != Value::Bool(true) {
            let reason = body["error"].as_str().unwrap_or("not ok").to_string();
            return Err(NotifyError::ChatRejected(reason));
        }

        if let Some(channel_id) = body["channel"].as_str() {
            if channel_id != self.channel {
                self.channel = channel_id.to_string();
            }
        }
        if let Some(ts) = body["ts"].as_str() {
            self.last_ts = Some(ts.to_string());
        }
        Ok(())
    }
}

/// Fenced code block with embedded fences defanged.
fn fenced(text: &str) -> String {
    format!("```{}```", text.replace("```", "'''"))
}

#[async_trait]
impl Deliver for ChatNotifier {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn deliver(&mut self, update: StatusUpdate) -> Result<(), NotifyError> {
        let attachment = match &update {
            StatusUpdate::Started => self.attachment(
                "warning",
                &format!("Build #{} started...", self.build_num.0),
                None,
            ),
            StatusUpdate::Finished(build) if build.succeeded() => self.attachment(
                "good",
                &format!("Build #{} successful!", self.build_num.0),
                None,
            ),
            StatusUpdate::Finished(build) => {
                let title = format!("Build #{} failed", self.build_num.0);
                let text = build.error.as_ref().map(|message| {
                    if build.log_tail.is_empty() {
                        fenced(message)
                    } else {
                        let tail = ANSI_RE.replace_all(&build.log_tail, "");
                        fenced(&format!("...\n{tail}\n{message}"))
                    }
                });
                self.attachment("danger", &title, text.as_deref())
            }
        };
        self.post_or_update(attachment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::FinishedBuild;
    use crate::types::{BuildStatus, ProjectId, RequestId, Sha, TriggerKind};
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn descriptor(pr_num: Option<u64>) -> BuildDescriptor {
        BuildDescriptor {
            project: ProjectId::new("gh/octocat/hello"),
            build_num: BuildNumber(9),
            event_type: match pr_num {
                Some(_) => TriggerKind::PullRequest,
                None => TriggerKind::Push,
            },
            pr_num,
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

    type Call = (String, HashMap<String, String>);

    #[derive(Clone, Default)]
    struct ChatApi {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    async fn handle(
        State(api): State<ChatApi>,
        axum::extract::Path(method): axum::extract::Path<String>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        api.calls.lock().unwrap().push((method, form));
        Json(serde_json::json!({"ok": true, "channel": "C024BE91L", "ts": "1503435956.000247"}))
    }

    async fn chat_server(api: ChatApi) -> String {
        let app = Router::new().route("/{method}", post(handle)).with_state(api);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn finished(error: Option<&str>, log_tail: &str) -> FinishedBuild {
        FinishedBuild {
            descriptor: descriptor(None),
            status: match error {
                Some(_) => BuildStatus::Failure,
                None => BuildStatus::Success,
            },
            ended_at: Utc::now(),
            error: error.map(String::from),
            log_tail: log_tail.to_string(),
        }
    }

    #[tokio::test]
    async fn first_post_then_in_place_update() {
        let api = ChatApi::default();
        let api_url = chat_server(api.clone()).await;
        let mut notifier = ChatNotifier::new(
            &api_url,
            "xoxb-token",
            &ChatConfig::default(),
            &descriptor(None),
            "http://logs.example/9",
        );

        notifier.deliver(StatusUpdate::Started).await.unwrap();
        notifier
            .deliver(StatusUpdate::Finished(finished(None, "")))
            .await
            .unwrap();

        let calls = api.calls.lock().unwrap();
        assert_eq!(calls[0].0, "chat.postMessage");
        assert_eq!(calls[0].1["channel"], "#general");
        assert_eq!(calls[0].1["username"], "Boxcar");
        assert_eq!(calls[0].1["as_user"], "false");

        // Second call updates the first message, on the rewritten channel id
        assert_eq!(calls[1].0, "chat.update");
        assert_eq!(calls[1].1["ts"], "1503435956.000247");
        assert_eq!(calls[1].1["channel"], "C024BE91L");
    }

    #[tokio::test]
    async fn start_attachment_links_the_build() {
        let api = ChatApi::default();
        let api_url = chat_server(api.clone()).await;
        let mut notifier = ChatNotifier::new(
            &api_url,
            "xoxb-token",
            &ChatConfig::default(),
            &descriptor(Some(42)),
            "http://logs.example/9",
        );

        notifier.deliver(StatusUpdate::Started).await.unwrap();

        let calls = api.calls.lock().unwrap();
        let attachments: Value = serde_json::from_str(&calls[0].1["attachments"]).unwrap();
        let attachment = &attachments[0];
        assert_eq!(attachment["color"], "warning");
        assert_eq!(attachment["title"], "Build #9 started...");
        assert_eq!(attachment["title_link"], "http://logs.example/9");
        assert_eq!(
            attachment["fields"][0]["value"],
            "<https://github.com/octocat/hello|octocat/hello>"
        );
        assert_eq!(attachment["fields"][1]["title"], "Pull Request");
        assert_eq!(
            attachment["fields"][1]["value"],
            "<https://github.com/octocat/hello/pull/42|#42>"
        );
    }

    #[tokio::test]
    async fn failure_text_carries_the_stripped_log_tail() {
        let api = ChatApi::default();
        let api_url = chat_server(api.clone()).await;
        let mut notifier = ChatNotifier::new(
            &api_url,
            "xoxb-token",
            &ChatConfig::default(),
            &descriptor(None),
            "http://logs.example/9",
        );

        let build = finished(
            Some("Command \"npm test\" failed with code 1"),
            "\x1b[31mFAIL\x1b[0m src/index.test.js\n```inner fence```",
        );
        notifier.deliver(StatusUpdate::Finished(build)).await.unwrap();

        let calls = api.calls.lock().unwrap();
        let attachments: Value = serde_json::from_str(&calls[0].1["attachments"]).unwrap();
        let attachment = &attachments[0];
        assert_eq!(attachment["color"], "danger");
        assert_eq!(attachment["title"], "Build #9 failed");
        let text = attachment["text"].as_str().unwrap();
        assert!(!text.contains('\x1b'), "ANSI escapes must be stripped");
        assert!(text.starts_with("```...\nFAIL src/index.test.js\n'''inner fence'''\n"));
        assert!(text.ends_with("Command \"npm test\" failed with code 1```"));
        assert_eq!(attachment["mrkdwn_in"], serde_json::json!(["text"]));
    }

    #[tokio::test]
    async fn api_level_rejection_is_an_error() {
        async fn reject(Form(_): Form<HashMap<String, String>>) -> Json<Value> {
            Json(serde_json::json!({"ok": false, "error": "channel_not_found"}))
        }

        let app = Router::new().route("/{method}", post(reject));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut notifier = ChatNotifier::new(
            format!("http://{addr}"),
            "xoxb-token",
            &ChatConfig::default(),
            &descriptor(None),
            "http://logs.example/9",
        );
        let error = notifier.deliver(StatusUpdate::Started).await.unwrap_err();
        match error {
            NotifyError::ChatRejected(reason) => assert_eq!(reason, "channel_not_found"),
            other => panic!("expected a chat rejection, got {other}"),
        }
        // No handle came back, so the next delivery posts fresh
        assert!(notifier.last_ts.is_none());
    }
}
