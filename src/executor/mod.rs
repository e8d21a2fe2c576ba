//! Build orchestration.
//!
//! [`Executor::run_build`] drives one trigger from descriptor to terminal
//! status: retry absorption, stored config resolution, gating, clone,
//! repository file overrides, record creation, then the command either runs
//! in-process or is delegated to a container runner. Failures before the
//! record exists surface only to the caller; once a record is open, every
//! exit path goes through the same finalization so notifiers and the store
//! always hear about the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{FinishTask, FinishTaskError, FinishedBuild, StatusBroadcaster};
use crate::config::{
    env_pairs, init_config, prepare_build_config, resolve_env, ConfigError, ContainerSetting,
    EffectiveConfig, Settings,
};
use crate::git::{self, CloneConfig, CloneError};
use crate::notify::{ChatNotifier, CommitStatusNotifier, DeliveryQueue, TopicNotifier};
use crate::runner::{run_command, spawn_flusher, BuildLog, LogSink, RunError};
use crate::store::{BuildStore, StoreError};
use crate::types::{BuildDescriptor, BuildNumber, BuildRecord, BuildStatus};

pub mod container;

pub use container::{ContainerLauncher, HttpContainerLauncher, LaunchError, LaunchSpec};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Command(#[from] RunError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The spawned build task itself died, usually a panic.
    #[error("Build task failed: {0}")]
    Aborted(String),
}

/// How a trigger ended. Only `Completed` and the error paths finalize a
/// record; the other outcomes never opened one, or handed it off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A build already exists under this request id.
    AlreadyBuilt(BuildNumber),
    /// Config gating turned the build off.
    Skipped,
    Completed(BuildNumber),
    /// Launched on the container runner, which owns the terminal status.
    Delegated(BuildNumber),
}

#[derive(Clone)]
pub struct Executor {
    pub settings: Settings,
    pub clone_config: CloneConfig,
    pub store: Arc<dyn BuildStore>,
    pub log_sink: Arc<dyn LogSink>,
    pub launcher: Arc<dyn ContainerLauncher>,
}

impl Executor {
    pub fn new(
        settings: Settings,
        store: Arc<dyn BuildStore>,
        log_sink: Arc<dyn LogSink>,
        launcher: Arc<dyn ContainerLauncher>,
    ) -> Self {
        let clone_config = CloneConfig::new(settings.build_base_dir());
        Executor {
            settings,
            clone_config,
            store,
            log_sink,
            launcher,
        }
    }

    /// Runs one build to its outcome.
    ///
    /// Store and clone errors before the record is opened abort the attempt
    /// with no externally visible status. Everything after record creation
    /// settles through the broadcaster, so an `Err` from this function means
    /// notifiers already saw the failure.
    pub async fn run_build(
        &self,
        mut descriptor: BuildDescriptor,
    ) -> Result<BuildOutcome, BuildError> {
        let config_keys = [
            "global".to_string(),
            descriptor.project.as_str().to_string(),
        ];
        let (existing, stored, ()) = tokio::join!(
            self.store
                .find_by_request_id(&descriptor.project, &descriptor.request_id),
            self.store.get_configs(&config_keys),
            self.check_version(),
        );

        if let Some(record) = existing? {
            info!(
                project = %descriptor.project,
                build = record.build_num.0,
                request_id = %descriptor.request_id,
                "retried delivery absorbed"
            );
            return Ok(BuildOutcome::AlreadyBuilt(record.build_num));
        }

        let config = init_config(&stored?, &descriptor);
        let view = EffectiveConfig::from_value(&config)?;
        if !view.build && !view.allow_config_overrides.allows_any() {
            info!(
                project = %descriptor.project,
                branch = %descriptor.branch,
                "build disabled by config"
            );
            return Ok(BuildOutcome::Skipped);
        }

        // The log starts before the clone so clone output lands in it.
        let log = Arc::new(BuildLog::default());
        let clone_dir = git::clone(&self.clone_config, &descriptor, &view, &log).await?;

        let config = prepare_build_config(config, &descriptor, &clone_dir).await?;
        let view = EffectiveConfig::from_value(&config)?;
        if !view.build {
            info!(
                project = %descriptor.project,
                branch = %descriptor.branch,
                "build disabled after repository config"
            );
            return Ok(BuildOutcome::Skipped);
        }

        let build_num = self.store.next_build_number(&descriptor.project).await?;
        descriptor.build_num = build_num;
        self.store.put_build(&BuildRecord::open(&descriptor)).await?;
        info!(
            project = %descriptor.project,
            build = build_num.0,
            commit = %descriptor.commit,
            "build record opened"
        );

        let mut env = resolve_env(&view);
        env.insert(
            "BOXCAR_BUILD_NUM".to_string(),
            Value::String(build_num.0.to_string()),
        );

        let log_url = self.log_sink.location(&descriptor.project, build_num);
        let mut broadcaster = StatusBroadcaster::new();
        self.attach_notifiers(&mut broadcaster, &descriptor, &view, &log_url, true);
        self.attach_store_update(&mut broadcaster);

        let stop = CancellationToken::new();
        let flusher = spawn_flusher(
            Arc::clone(&self.log_sink),
            Arc::clone(&log),
            descriptor.project.clone(),
            build_num,
            stop.clone(),
        );
        broadcaster.broadcast_start(&descriptor);

        let latch = CompletionLatch {
            broadcaster,
            log: Arc::clone(&log),
            stop,
            flusher,
        };

        if view.wants_container() {
            return match self.launch_container(&view, &env).await {
                Ok(()) => {
                    latch.release().await;
                    info!(
                        project = %descriptor.project,
                        build = build_num.0,
                        "build delegated to container runner"
                    );
                    Ok(BuildOutcome::Delegated(build_num))
                }
                Err(error) => {
                    let error = BuildError::from(error);
                    latch.settle(&descriptor, Some(&error)).await;
                    Err(error)
                }
            };
        }

        let cmd = view.cmd.clone();
        let workdir = clone_dir.clone();
        let pairs = env_pairs(&env);
        let timeout = view.timeout.map(Duration::from_secs);
        let run_log = Arc::clone(&log);
        let task = tokio::spawn(async move {
            run_command(&cmd, &workdir, &pairs, timeout, run_log).await
        });

        // A panicking task still settles the record, through Aborted.
        let run = match task.await {
            Ok(run) => run.map_err(BuildError::from),
            Err(join) => Err(BuildError::Aborted(join.to_string())),
        };

        match run {
            Ok(()) => {
                latch.settle(&descriptor, None).await;
                Ok(BuildOutcome::Completed(build_num))
            }
            Err(error) => {
                latch.settle(&descriptor, Some(&error)).await;
                Err(error)
            }
        }
    }

    /// Wires the configured notifiers into a broadcaster. Also used by the
    /// status-update action to rebuild the notifier set for a delegated
    /// build, where no start announcement is wanted.
    pub fn attach_notifiers(
        &self,
        broadcaster: &mut StatusBroadcaster,
        descriptor: &BuildDescriptor,
        config: &EffectiveConfig,
        log_url: &str,
        announce_start: bool,
    ) {
        if let Some(token) = config.github_token() {
            let notifier = CommitStatusNotifier::new(
                &self.settings.github_api_url,
                token,
                &self.settings.stack,
                self.settings.status_context(),
                descriptor,
                log_url,
            );
            DeliveryQueue::spawn(notifier).attach(broadcaster, announce_start);
        }
        if let Some(chat) = &config.notifications.slack {
            if let Some(token) = config.chat_token() {
                let notifier =
                    ChatNotifier::new(&self.settings.chat_api_url, token, chat, descriptor, log_url);
                DeliveryQueue::spawn(notifier).attach(broadcaster, announce_start);
            }
        }
        if let Some(topic) = &config.notifications.topic {
            if !topic.url.is_empty() {
                let notifier = TopicNotifier::new(&topic.url, descriptor, log_url);
                DeliveryQueue::spawn(notifier).attach(broadcaster, false);
            }
        }
    }

    /// Registers the finish task that persists the terminal status.
    pub fn attach_store_update(&self, broadcaster: &mut StatusBroadcaster) {
        broadcaster.register_finish_task(Arc::new(StoreFinish {
            store: Arc::clone(&self.store),
        }));
    }

    /// Advisory only. A stack whose stored config was written by a different
    /// release gets a warning in the service log; nothing ever fails here.
    async fn check_version(&self) {
        match self.store.get_global_config_value("version").await {
            Ok(Some(Value::String(stored))) if stored != env!("CARGO_PKG_VERSION") => {
                warn!(
                    stored = %stored,
                    running = env!("CARGO_PKG_VERSION"),
                    "stack config version differs from the running binary"
                );
            }
            Ok(_) => {}
            Err(error) => debug!(%error, "version check skipped"),
        }
    }

    async fn launch_container(
        &self,
        view: &EffectiveConfig,
        env: &Map<String, Value>,
    ) -> Result<(), LaunchError> {
        let overrides = view
            .container
            .as_ref()
            .map(ContainerSetting::overrides)
            .unwrap_or_default();
        let spec = LaunchSpec::new(&self.settings.stack, &overrides, env);
        self.launcher.launch(&spec).await
    }
}

/// Owns everything that must happen exactly once when a build ends: the log
/// flusher shutdown and the finish broadcast. Consuming it by value is what
/// makes double finalization unrepresentable.
struct CompletionLatch {
    broadcaster: StatusBroadcaster,
    log: Arc<BuildLog>,
    stop: CancellationToken,
    flusher: JoinHandle<()>,
}

impl CompletionLatch {
    /// Delegated builds: final log flush only. The record stays pending and
    /// the container runner reports the terminal status later.
    async fn release(self) {
        Self::stop_flusher(self.stop, self.flusher).await;
    }

    /// Full finalization: flush, then broadcast the terminal status.
    async fn settle(mut self, descriptor: &BuildDescriptor, error: Option<&BuildError>) {
        Self::stop_flusher(self.stop, self.flusher).await;

        let status = match error {
            None => BuildStatus::Success,
            Some(_) => BuildStatus::Failure,
        };
        let log_tail = match error {
            Some(BuildError::Command(run)) => run
                .log_tail()
                .map(str::to_string)
                .unwrap_or_else(|| self.log.tail()),
            _ => self.log.tail(),
        };
        let build = FinishedBuild {
            descriptor: descriptor.clone(),
            status,
            ended_at: Utc::now(),
            error: error.map(ToString::to_string),
            log_tail,
        };
        info!(
            project = %build.descriptor.project,
            build = build.descriptor.build_num.0,
            status = status.as_str(),
            "build finished"
        );
        self.broadcaster.broadcast_finish(Arc::new(build)).await;
    }

    async fn stop_flusher(stop: CancellationToken, flusher: JoinHandle<()>) {
        stop.cancel();
        if let Err(error) = flusher.await {
            warn!(%error, "log flusher did not shut down cleanly");
        }
    }
}

/// Finish task persisting the terminal status on the build record.
struct StoreFinish {
    store: Arc<dyn BuildStore>,
}

#[async_trait]
impl FinishTask for StoreFinish {
    fn name(&self) -> &'static str {
        "record-store"
    }

    async fn run(&self, build: &FinishedBuild) -> Result<(), FinishTaskError> {
        self.store
            .update_terminal(
                &build.descriptor.project,
                build.descriptor.build_num,
                build.status,
                build.ended_at,
            )
            .await?;
        Ok(())
    }
}
