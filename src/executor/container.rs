//! Container delegation.
//!
//! A build whose config enables `container` is not run in-process; it is
//! handed to an external runner which executes the same command inside a
//! task container and reports back through the status-update action. The
//! launch spec carries everything the runner needs: where to run (cluster,
//! task definition, container name), the resolved build environment, and an
//! optional command override.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::config::{env_pairs, ContainerOverrides};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no container runner endpoint is configured")]
    NoEndpoint,

    #[error("container runner rejected the launch: {status}: {message}")]
    Rejected { status: StatusCode, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One entry of the environment handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Everything the external runner needs to start a build task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub cluster: String,
    pub task: String,
    pub container: String,
    pub environment: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl LaunchSpec {
    /// Fills in stack-derived defaults for anything the config left unset.
    /// `cmd` becomes a `bash -c` command override so the task container does
    /// not need to know the shell line in advance.
    pub fn new(stack: &str, overrides: &ContainerOverrides, env: &Map<String, Value>) -> Self {
        let environment = env_pairs(env)
            .into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect();
        LaunchSpec {
            cluster: overrides
                .cluster
                .clone()
                .unwrap_or_else(|| stack.to_string()),
            task: overrides
                .task
                .clone()
                .unwrap_or_else(|| format!("{stack}-BuildTask")),
            container: overrides
                .container
                .clone()
                .unwrap_or_else(|| "build".to_string()),
            environment,
            command: overrides
                .cmd
                .clone()
                .map(|cmd| vec!["bash".to_string(), "-c".to_string(), cmd]),
        }
    }
}

#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), LaunchError>;
}

/// Posts the launch spec as JSON to a configured runner endpoint.
pub struct HttpContainerLauncher {
    http: reqwest::Client,
    url: Option<String>,
}

impl HttpContainerLauncher {
    pub fn new(url: Option<String>) -> Self {
        HttpContainerLauncher {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ContainerLauncher for HttpContainerLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), LaunchError> {
        let url = self.url.as_deref().ok_or(LaunchError::NoEndpoint)?;
        let response = self.http.post(url).json(spec).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(LaunchError::Rejected { status, message });
        }
        info!(cluster = %spec.cluster, task = %spec.task, "container task launched");
        Ok(())
    }
}
