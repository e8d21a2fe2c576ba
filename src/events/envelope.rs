//! Transport envelope decoding.
//!
//! The core entry point receives one JSON envelope per invocation, in one of
//! three shapes:
//!
//!  1. an infrastructure-update event (carries a `ResourceType` key),
//!     acknowledged and otherwise ignored;
//!  2. a direct action (carries an `action` key) naming one of the
//!     registered actions;
//!  3. a provider notification (carries a `message` key), holding either a
//!     complete event body or one page of a split delivery.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::store::Fragment;
use crate::types::{BuildDescriptor, BuildNumber, BuildStatus, ProjectId};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// None of the known envelope shapes matched.
    #[error("unknown event envelope")]
    UnknownShape,

    #[error("malformed action envelope: {0}")]
    BadAction(#[source] serde_json::Error),

    #[error("malformed notification envelope: {0}")]
    BadNotification(#[source] serde_json::Error),

    #[error("notification message is not valid JSON: {0}")]
    MessageNotJson(#[source] serde_json::Error),

    #[error("fragment payload is not valid base64: {0}")]
    BadFragmentEncoding(#[from] base64::DecodeError),

    #[error("partial notification is missing {0}")]
    MissingAttribute(&'static str),
}

/// A decoded invocation envelope.
#[derive(Debug)]
pub enum Envelope {
    /// Stack plumbing notification; answered without any build work.
    InfraUpdate,
    Action(ActionEnvelope),
    Notification(NotificationEnvelope),
}

/// A directly invoked action.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ActionEnvelope {
    /// Run a build from a fully specified descriptor.
    Build(Box<BuildDescriptor>),

    /// Re-run a persisted build under a fresh build number.
    #[serde(rename_all = "camelCase")]
    Rebuild {
        project: ProjectId,
        build_num: BuildNumber,
    },

    /// Report the running core version.
    Version,

    /// Complete a build that was delegated to a container.
    #[serde(rename_all = "camelCase")]
    UpdateStatus {
        project: ProjectId,
        build_num: BuildNumber,
        status: BuildStatus,
    },
}

/// A provider notification: the raw message plus routing attributes.
#[derive(Debug, Deserialize)]
pub struct NotificationEnvelope {
    pub message: String,

    #[serde(default)]
    pub attributes: NotificationAttributes,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationAttributes {
    #[serde(rename = "X-Github-Event")]
    pub event_type: Option<String>,

    /// Present on split deliveries; groups the pages of one notification.
    pub checksum: Option<String>,

    #[serde(rename = "pageNumber")]
    pub page_number: Option<u32>,

    #[serde(rename = "pageTotal")]
    pub page_total: Option<u32>,
}

/// What a notification envelope carries once decoded.
#[derive(Debug)]
pub enum NotificationPayload {
    /// The full event body.
    Complete(Value),

    /// One page of a split delivery, to be handed to reassembly.
    Partial(Fragment),
}

impl Envelope {
    /// Classifies a request body into one of the three envelope shapes.
    pub fn classify(body: Value) -> Result<Envelope, EnvelopeError> {
        let Some(object) = body.as_object() else {
            return Err(EnvelopeError::UnknownShape);
        };

        if object.contains_key("ResourceType") {
            return Ok(Envelope::InfraUpdate);
        }
        if object.contains_key("action") {
            let action = serde_json::from_value(body).map_err(EnvelopeError::BadAction)?;
            return Ok(Envelope::Action(action));
        }
        if object.contains_key("message") {
            let notification =
                serde_json::from_value(body).map_err(EnvelopeError::BadNotification)?;
            return Ok(Envelope::Notification(notification));
        }

        Err(EnvelopeError::UnknownShape)
    }
}

impl NotificationEnvelope {
    pub fn event_type(&self) -> Option<&str> {
        self.attributes.event_type.as_deref()
    }

    /// Decodes the message: a checksum attribute marks a split delivery,
    /// whose message body is the base64 of one compressed page.
    pub fn payload(&self) -> Result<NotificationPayload, EnvelopeError> {
        let Some(checksum) = &self.attributes.checksum else {
            let body =
                serde_json::from_str(&self.message).map_err(EnvelopeError::MessageNotJson)?;
            return Ok(NotificationPayload::Complete(body));
        };

        let page_number = self
            .attributes
            .page_number
            .ok_or(EnvelopeError::MissingAttribute("pageNumber"))?;
        let page_total = self
            .attributes
            .page_total
            .ok_or(EnvelopeError::MissingAttribute("pageTotal"))?;
        let payload = STANDARD.decode(&self.message)?;

        Ok(NotificationPayload::Partial(Fragment {
            checksum: checksum.clone(),
            page_number,
            page_total,
            payload,
        }))
    }
}
