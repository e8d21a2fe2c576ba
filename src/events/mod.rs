//! Inbound event handling: envelope decode, webhook signature checks,
//! partial-message reassembly, and payload parsing into build descriptors.

pub mod envelope;
pub mod parser;
pub mod reassembly;
pub mod signature;
pub mod trim;

pub use envelope::{
    ActionEnvelope, Envelope, EnvelopeError, NotificationAttributes, NotificationEnvelope,
    NotificationPayload,
};
pub use parser::{parse_event, ParseError, ParseOutcome};
pub use reassembly::{add_fragment, split_into_fragments, ReassemblyError, ReassemblyOutcome};
pub use signature::verify_signature;
