//! Request handlers for the two intake endpoints.
//!
//! `POST /webhook` takes GitHub deliveries directly; `POST /` takes the
//! queue-style envelopes that actions, notifications, and stack plumbing
//! arrive in. Both funnel parsed events into the same spawned-build path.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::actions::{self, ActionError, ActionOutcome};
use crate::events::{
    add_fragment, parse_event, verify_signature, Envelope, EnvelopeError, NotificationPayload,
    ParseError, ParseOutcome, ReassemblyError, ReassemblyOutcome,
};
use crate::executor::BuildOutcome;
use crate::types::{BuildDescriptor, RequestId};

/// Header name for GitHub event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for GitHub delivery ID.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for GitHub signature.
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors that can occur while handling an intake request.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error(transparent)]
    Action(#[from] ActionError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::MissingHeader(_) | ServerError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            ServerError::InvalidSignature => StatusCode::UNAUTHORIZED,
            ServerError::Envelope(_) | ServerError::Parse(_) => StatusCode::BAD_REQUEST,
            ServerError::Reassembly(ReassemblyError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Reassembly(_) => StatusCode::BAD_REQUEST,
            ServerError::Action(ActionError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServerError::Action(ActionError::NotTerminal(_)) => StatusCode::BAD_REQUEST,
            ServerError::Action(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        (status, Json(json!({"msg": self.to_string()}))).into_response()
    }
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST
/// - Required headers:
///   - `X-GitHub-Event`: Event type (e.g., "push", "pull_request")
///   - `X-GitHub-Delivery`: Unique delivery ID
///   - `X-Hub-Signature-256`: HMAC-SHA256 signature of the payload; only
///     required when a webhook secret is configured
/// - Body: JSON webhook payload
///
/// # Response
///
/// - 200 OK: build started, delivery ignored (with the reason), or pong
/// - 400 Bad Request: missing header, invalid JSON, or unparseable event
/// - 401 Unauthorized: invalid signature
///
/// Builds run in a spawned task; the response does not wait for them.
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServerError> {
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let delivery_id = get_header(&headers, HEADER_DELIVERY)?;

    debug!(
        delivery_id = %delivery_id,
        event_type = %event_type,
        "received webhook"
    );

    // Signature before anything else; an unverified body is not parsed.
    if let Some(secret) = app_state.webhook_secret() {
        let signature_header = get_header(&headers, HEADER_SIGNATURE)?;
        if !verify_signature(&body, &signature_header, secret) {
            warn!(delivery_id = %delivery_id, "invalid webhook signature");
            return Err(ServerError::InvalidSignature);
        }
    }

    if event_type == "ping" {
        return Ok(Json(json!({"msg": "pong"})));
    }

    let payload: Value = serde_json::from_slice(&body)?;
    let request_id = RequestId::new(delivery_id);
    respond_to_event(&app_state, payload, Some(event_type.as_str()), request_id)
}

/// Envelope handler.
///
/// Accepts the three envelope shapes that arrive on the queue endpoint:
/// infrastructure updates (acknowledged without work), actions (run to
/// completion before responding), and provider notifications, whole or as
/// pages of a split delivery.
pub async fn envelope_handler(
    State(app_state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ServerError> {
    let payload: Value = serde_json::from_slice(&body)?;
    let request_id = request_id_of(&payload);

    match Envelope::classify(payload)? {
        Envelope::InfraUpdate => {
            info!("infrastructure update acknowledged");
            Ok(Json(json!({"msg": "ok"})))
        }
        Envelope::Action(action) => {
            let outcome = actions::dispatch(app_state.executor(), action, request_id).await?;
            Ok(Json(action_reply(outcome)))
        }
        Envelope::Notification(notification) => {
            let event_type = notification.event_type().map(str::to_string);
            let event = match notification.payload()? {
                NotificationPayload::Complete(event) => event,
                NotificationPayload::Partial(fragment) => {
                    match add_fragment(app_state.fragments(), fragment).await? {
                        ReassemblyOutcome::Complete(bytes) => serde_json::from_slice(&bytes)?,
                        ReassemblyOutcome::Pending { have, want } => {
                            debug!(have, want, "stored notification fragment");
                            return Ok(Json(json!({
                                "msg": format!("stored page {have} of {want}")
                            })));
                        }
                    }
                }
            };
            respond_to_event(&app_state, event, event_type.as_deref(), request_id)
        }
    }
}

/// Handler for the `/health` endpoint.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Parses an event and either spawns its build or reports why not.
fn respond_to_event(
    app_state: &AppState,
    payload: Value,
    event_type: Option<&str>,
    request_id: RequestId,
) -> Result<Json<Value>, ServerError> {
    match parse_event(payload, event_type, request_id)? {
        ParseOutcome::Ignore(reason) => {
            info!(%reason, "delivery ignored");
            Ok(Json(json!({"msg": reason})))
        }
        ParseOutcome::Build(descriptor) => {
            info!(
                project = %descriptor.project,
                branch = %descriptor.branch,
                commit = %descriptor.commit,
                "build accepted"
            );
            spawn_build(app_state, descriptor);
            Ok(Json(json!({"msg": "build started"})))
        }
    }
}

/// Runs a build in the background. Failures are already settled into the
/// record and the notifiers, so they are only logged here.
fn spawn_build(app_state: &AppState, descriptor: BuildDescriptor) {
    let executor = app_state.executor().clone();
    tokio::spawn(async move {
        if let Err(error) = executor.run_build(descriptor).await {
            warn!(error = %error, "background build failed");
        }
    });
}

/// The idempotency token for an envelope: its own `requestId` when it
/// carries one, a fresh one otherwise. Build actions ignore this and use
/// the request id inside their descriptor.
fn request_id_of(payload: &Value) -> RequestId {
    match payload.get("requestId").and_then(Value::as_str) {
        Some(id) => RequestId::new(id),
        None => RequestId::new(Uuid::new_v4().to_string()),
    }
}

fn action_reply(outcome: ActionOutcome) -> Value {
    match outcome {
        ActionOutcome::Build(outcome) => json!({"msg": build_reply(&outcome)}),
        ActionOutcome::Version(version) => json!({"version": version}),
        ActionOutcome::StatusUpdated(num) => {
            json!({"msg": format!("Build #{num} marked finished")})
        }
        ActionOutcome::StatusUnchanged(num) => {
            json!({"msg": format!("Build #{num} had already finished")})
        }
    }
}

fn build_reply(outcome: &BuildOutcome) -> String {
    match outcome {
        BuildOutcome::AlreadyBuilt(num) => {
            format!("Build #{num} was already started by this delivery")
        }
        BuildOutcome::Skipped => "Build is disabled by config".to_string(),
        BuildOutcome::Completed(num) => format!("Build #{num} succeeded"),
        BuildOutcome::Delegated(num) => format!("Build #{num} launched on the container runner"),
    }
}

/// Extracts a required header value as a string.
fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, ServerError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(ServerError::MissingHeader(name))
}
