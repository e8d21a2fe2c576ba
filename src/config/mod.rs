//! Build configuration: process settings, defaults, layering, and gating.
//!
//! Configuration travels through resolution as raw JSON ([`serde_json::Value`])
//! so that store layers and repository files can carry arbitrary keys; the
//! executor reads a typed [`EffectiveConfig`] view at each decision point.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub mod file;
pub mod merge;
pub mod resolve;
pub mod rules;

pub use file::{ExecutableLoader, FileConfigLoader, StaticDataLoader};
pub use merge::{merged, merged_layers};
pub use resolve::{env_pairs, init_config, prepare_build_config, resolve_env};
pub use rules::apply_branch_rules;

/// Process-level settings, read once at startup.
///
/// Everything here is deployment plumbing; per-build behavior lives in the
/// layered config (see [`default_config`]).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deployment namespace: table prefixes, the commit-status context, and
    /// the base working directory all derive from it.
    pub stack: String,
    pub bind_addr: SocketAddr,
    /// Shared secret for webhook signature verification; unsigned deliveries
    /// are accepted when unset.
    pub webhook_secret: Option<String>,
    pub base_dir: PathBuf,
    /// Root the log sink writes under. Outside the build dir, which is wiped
    /// before every clone.
    pub log_dir: PathBuf,
    pub github_api_url: String,
    pub chat_api_url: String,
    /// Endpoint container-task launches are POSTed to. Container builds fail
    /// to launch when unset.
    pub runner_url: Option<String>,
}

impl Settings {
    /// Settings with all defaults for the given stack name.
    pub fn for_stack(stack: impl Into<String>) -> Self {
        let stack = stack.into();
        let base_dir = PathBuf::from("/tmp").join(&stack);
        Settings {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            webhook_secret: None,
            log_dir: base_dir.join("logs"),
            base_dir,
            github_api_url: "https://api.github.com".to_string(),
            chat_api_url: "https://slack.com/api".to_string(),
            runner_url: None,
            stack,
        }
    }

    /// Reads settings from `BOXCAR_*` environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let stack = env::var("BOXCAR_STACK").unwrap_or_else(|_| "boxcar".to_string());
        let mut settings = Settings::for_stack(stack);
        if let Ok(bind) = env::var("BOXCAR_BIND") {
            match bind.parse() {
                Ok(addr) => settings.bind_addr = addr,
                Err(_) => tracing::warn!(value = %bind, "ignoring unparseable BOXCAR_BIND"),
            }
        }
        if let Ok(secret) = env::var("BOXCAR_WEBHOOK_SECRET") {
            settings.webhook_secret = Some(secret);
        }
        if let Ok(dir) = env::var("BOXCAR_BASE_DIR") {
            settings.base_dir = PathBuf::from(&dir);
            settings.log_dir = settings.base_dir.join("logs");
        }
        if let Ok(dir) = env::var("BOXCAR_LOG_DIR") {
            settings.log_dir = PathBuf::from(dir);
        }
        if let Ok(url) = env::var("BOXCAR_GITHUB_API") {
            settings.github_api_url = url;
        }
        if let Ok(url) = env::var("BOXCAR_CHAT_API") {
            settings.chat_api_url = url;
        }
        if let Ok(url) = env::var("BOXCAR_RUNNER_URL") {
            settings.runner_url = Some(url);
        }
        settings
    }

    /// Every build's working directory lives under this path, and it is
    /// recursively removed before each clone.
    pub fn build_base_dir(&self) -> PathBuf {
        self.base_dir.join("build")
    }

    pub fn status_context(&self) -> String {
        format!("continuous-integration/{}", self.stack)
    }

    pub fn builds_table(&self) -> String {
        format!("{}-builds", self.stack)
    }

    pub fn config_table(&self) -> String {
        format!("{}-config", self.stack)
    }
}

/// The built-in lowest-precedence config layer.
///
/// Builds are off except on `master` and for pull requests; fork PRs from
/// public repos run without secrets and may only override `cmd` and `env`.
pub fn default_config() -> Value {
    json!({
        "cmd": "npm install && npm test",
        "env": {},
        "secretEnv": {
            "GITHUB_TOKEN": "",
            "SLACK_TOKEN": "",
        },
        "inheritSecrets": true,
        "allowConfigOverrides": true,
        "git": {
            "depth": 5,
        },
        "notifications": {
            "slack": {
                "channel": "#general",
                "username": "Boxcar",
                "asUser": false,
            },
        },
        "build": false,
        "branches": {
            "master": true,
        },
        "pullRequests": {
            "fromSelfPublicRepo": true,
            "fromSelfPrivateRepo": true,
            "fromForkPublicRepo": {
                "build": true,
                "inheritSecrets": false,
                "allowConfigOverrides": ["cmd", "env"],
            },
            "fromForkPrivateRepo": false,
        },
    })
}

/// Error reading a typed view out of a merged config value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Whether repository files may override resolved config, and which keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OverridePolicy {
    Enabled(bool),
    Keys(Vec<String>),
}

impl OverridePolicy {
    /// True unless overrides are switched off entirely. A key list counts as
    /// enabled even when empty.
    pub fn allows_any(&self) -> bool {
        !matches!(self, OverridePolicy::Enabled(false))
    }

    /// The explicit key allow-list, if overrides are restricted to one.
    pub fn allowed_keys(&self) -> Option<&[String]> {
        match self {
            OverridePolicy::Keys(keys) => Some(keys),
            OverridePolicy::Enabled(_) => None,
        }
    }
}

impl Default for OverridePolicy {
    fn default() -> Self {
        OverridePolicy::Enabled(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub depth: u32,
}

impl Default for GitConfig {
    fn default() -> Self {
        GitConfig { depth: 5 }
    }
}

/// Chat notification settings (`notifications.slack`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    pub channel: String,
    pub username: String,
    pub as_user: bool,
    pub icon_url: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            channel: "#general".to_string(),
            username: "Boxcar".to_string(),
            as_user: false,
            icon_url: None,
        }
    }
}

/// Topic notification settings (`notifications.topic`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub url: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        TopicConfig {
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Notifications {
    pub slack: Option<ChatConfig>,
    pub topic: Option<TopicConfig>,
}

/// Container delegation settings (`container`): `true` delegates with
/// defaults, an object overrides pieces of the launch spec.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ContainerSetting {
    Enabled(bool),
    Spec(ContainerOverrides),
}

impl ContainerSetting {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ContainerSetting::Enabled(false))
    }

    pub fn overrides(&self) -> ContainerOverrides {
        match self {
            ContainerSetting::Spec(overrides) => overrides.clone(),
            ContainerSetting::Enabled(_) => ContainerOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ContainerOverrides {
    pub cluster: Option<String>,
    pub task: Option<String>,
    pub container: Option<String>,
    pub cmd: Option<String>,
}

/// Typed view of a merged config value.
///
/// Unknown keys are carried by the raw value, not here; absent keys take
/// their field defaults so a sparse layer stack still reads cleanly.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EffectiveConfig {
    pub build: bool,
    pub cmd: String,
    pub env: Map<String, Value>,
    pub secret_env: Map<String, Value>,
    pub inherit_secrets: bool,
    pub allow_config_overrides: OverridePolicy,
    pub git: GitConfig,
    pub notifications: Notifications,
    pub container: Option<ContainerSetting>,
    /// Optional per-build timeout, in seconds.
    pub timeout: Option<u64>,
}

impl EffectiveConfig {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// The token used for private clones and commit-status calls. Empty
    /// string means no token.
    pub fn github_token(&self) -> Option<&str> {
        non_empty_str(self.secret_env.get("GITHUB_TOKEN"))
    }

    pub fn chat_token(&self) -> Option<&str> {
        non_empty_str(self.secret_env.get("SLACK_TOKEN"))
    }

    pub fn wants_container(&self) -> bool {
        self.container.as_ref().is_some_and(|c| c.is_enabled())
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}
