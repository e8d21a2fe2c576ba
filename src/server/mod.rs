//! HTTP surface of the build server.
//!
//! # Endpoints
//!
//! - `POST /` - queue-style envelope intake: actions, notifications, and
//!   infrastructure updates
//! - `POST /webhook` - direct GitHub webhook deliveries
//! - `GET /health` - liveness probe

use std::sync::Arc;

pub mod handler;

pub use handler::{envelope_handler, health_handler, webhook_handler, ServerError};

use crate::executor::Executor;
use crate::store::FragmentStore;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: Executor,

    /// Holds pages of split notifications between deliveries.
    fragments: Arc<dyn FragmentStore>,
}

impl AppState {
    pub fn new(executor: Executor, fragments: Arc<dyn FragmentStore>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                executor,
                fragments,
            }),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn fragments(&self) -> &dyn FragmentStore {
        self.inner.fragments.as_ref()
    }

    /// The shared webhook secret, when one is configured.
    pub fn webhook_secret(&self) -> Option<&[u8]> {
        self.inner
            .executor
            .settings
            .webhook_secret
            .as_deref()
            .map(str::as_bytes)
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/", post(envelope_handler))
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
