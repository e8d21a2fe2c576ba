//! Build status fan-out.
//!
//! Each build owns one [`StatusBroadcaster`]. Notifiers and the record store
//! hook in through two interactions:
//!
//!  1. start handlers, fired once and synchronously right before the build
//!     command begins; they enqueue work elsewhere and must not block;
//!  2. finish tasks, async callbacks run in parallel exactly once after the
//!     terminal status is decided. Every task settles before the invocation
//!     returns, a failing task never disturbs its siblings, and task errors
//!     are logged rather than propagated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::types::{BuildDescriptor, BuildStatus};

/// Boxed error for finish tasks; only ever logged.
pub type FinishTaskError = Box<dyn std::error::Error + Send + Sync>;

/// The terminal view of a build handed to finish tasks.
#[derive(Debug, Clone)]
pub struct FinishedBuild {
    pub descriptor: BuildDescriptor,
    pub status: BuildStatus,
    pub ended_at: DateTime<Utc>,

    /// Text of the failure that ended the build, when there was one.
    pub error: Option<String>,

    /// Trailing slice of build output, for notifier summaries.
    pub log_tail: String,
}

impl FinishedBuild {
    pub fn succeeded(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

/// One callback that must run to completion when a build finishes.
#[async_trait]
pub trait FinishTask: Send + Sync {
    /// Short name for the log line when the task fails.
    fn name(&self) -> &'static str;

    async fn run(&self, build: &FinishedBuild) -> Result<(), FinishTaskError>;
}

type StartHandler = Box<dyn FnOnce(&BuildDescriptor) + Send>;

/// Single-build event hub. Handlers and tasks run at most once; the
/// broadcaster is dropped with its build and never crosses invocations.
#[derive(Default)]
pub struct StatusBroadcaster {
    start_handlers: Vec<StartHandler>,
    finish_tasks: Vec<Arc<dyn FinishTask>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        StatusBroadcaster::default()
    }

    pub fn on_start(&mut self, handler: impl FnOnce(&BuildDescriptor) + Send + 'static) {
        self.start_handlers.push(Box::new(handler));
    }

    pub fn register_finish_task(&mut self, task: Arc<dyn FinishTask>) {
        self.finish_tasks.push(task);
    }

    /// Fires the start handlers in registration order, draining them.
    pub fn broadcast_start(&mut self, descriptor: &BuildDescriptor) {
        for handler in self.start_handlers.drain(..) {
            handler(descriptor);
        }
    }

    /// Runs every finish task in parallel and waits for all of them to
    /// settle. Draining the list keeps a second call from re-running tasks.
    pub async fn broadcast_finish(&mut self, build: Arc<FinishedBuild>) {
        let tasks = std::mem::take(&mut self.finish_tasks);
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let build = Arc::clone(&build);
                tokio::spawn(async move {
                    if let Err(error) = task.run(&build).await {
                        tracing::warn!(task = task.name(), %error, "finish task failed");
                    }
                })
            })
            .collect();

        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "finish task panicked");
            }
        }
    }
}
