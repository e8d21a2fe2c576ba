//! Build status notifiers.
//!
//! Each enabled sink (commit status, chat, topic) gets a [`DeliveryQueue`]:
//! a single worker draining an unbounded channel, so deliveries for one sink
//! land strictly in the order they were enqueued and a stale "started" can
//! never overwrite a terminal status. Delivery errors are logged and
//! swallowed; a broken notifier never fails a build or blocks its siblings.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::broadcast::{FinishTask, FinishTaskError, FinishedBuild, StatusBroadcaster};

pub mod chat;
pub mod commit_status;
pub mod topic;

pub use chat::ChatNotifier;
pub use commit_status::CommitStatusNotifier;
pub use topic::TopicNotifier;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("GitHub token is invalid")]
    BadToken,

    #[error("GitHub token has insufficient privileges or repository does not exist")]
    MissingPrivileges,

    #[error("status API returned {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("chat API rejected the message: {0}")]
    ChatRejected(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// One message on a notifier's queue.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    /// The build command is about to run.
    Started,

    /// The build reached a terminal status.
    Finished(FinishedBuild),
}

/// A sink that can apply one status update at a time.
///
/// The queue worker owns the deliverer exclusively, so implementations keep
/// plain mutable state (the chat sink remembers its message handle here).
#[async_trait]
pub trait Deliver: Send {
    fn name(&self) -> &'static str;

    async fn deliver(&mut self, update: StatusUpdate) -> Result<(), NotifyError>;
}

struct Delivery {
    update: StatusUpdate,
    done: Option<oneshot::Sender<()>>,
}

/// Handle to a notifier's serialized delivery worker.
#[derive(Clone)]
pub struct DeliveryQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl DeliveryQueue {
    /// Starts the worker task for a deliverer and returns its handle.
    pub fn spawn(mut deliverer: impl Deliver + 'static) -> Self {
        let name = deliverer.name();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();

        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                if let Err(error) = deliverer.deliver(delivery.update).await {
                    tracing::warn!(notifier = name, %error, "status delivery failed");
                }
                if let Some(done) = delivery.done {
                    let _ = done.send(());
                }
            }
        });

        DeliveryQueue { name, sender }
    }

    /// Enqueues without waiting. Start notifications use this so the
    /// broadcaster is never blocked on a slow sink.
    pub fn push(&self, update: StatusUpdate) {
        let delivery = Delivery { update, done: None };
        if self.sender.send(delivery).is_err() {
            tracing::warn!(notifier = self.name, "delivery queue is closed");
        }
    }

    /// Enqueues and waits until the update has been applied (or its failure
    /// logged). Terminal updates use this so the invocation does not return
    /// with a delivery still in flight.
    pub async fn push_and_wait(&self, update: StatusUpdate) {
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery {
            update,
            done: Some(tx),
        };
        if self.sender.send(delivery).is_err() {
            tracing::warn!(notifier = self.name, "delivery queue is closed");
            return;
        }
        let _ = rx.await;
    }

    /// Hooks this queue into a build's broadcaster: optionally a "started"
    /// enqueue, always a finish task that waits for the terminal delivery.
    pub fn attach(&self, broadcaster: &mut StatusBroadcaster, announce_start: bool) {
        if announce_start {
            let queue = self.clone();
            broadcaster.on_start(move |_| queue.push(StatusUpdate::Started));
        }
        broadcaster.register_finish_task(Arc::new(QueuedFinish {
            queue: self.clone(),
        }));
    }
}

/// Finish task that forwards the terminal build state onto the queue.
struct QueuedFinish {
    queue: DeliveryQueue,
}

#[async_trait]
impl FinishTask for QueuedFinish {
    fn name(&self) -> &'static str {
        self.queue.name
    }

    async fn run(&self, build: &FinishedBuild) -> Result<(), FinishTaskError> {
        // Failures were already logged by the worker.
        self.queue
            .push_and_wait(StatusUpdate::Finished(build.clone()))
            .await;
        Ok(())
    }
}
