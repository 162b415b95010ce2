//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire protocol shared by the operator client and the simulation server.
//!
//! Every message travels inside an [`Envelope`]; the payload variant is
//! selected by the `msg_type` tag. Use [`encode`] and [`decode`] to move
//! between envelopes and their JSON text form.
#![warn(missing_docs)]

pub mod codec;
pub mod logging;
pub mod types;

/// Shared result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Reasons an inbound message is rejected by the codec.
///
/// All variants are recoverable: the offending message is dropped and the
/// connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The sender speaks a different revision of the schema.
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Version compiled into this build.
        expected: &'static str,
        /// Version announced by the sender.
        found: String,
    },
    /// The `msg_type` tag is not one of the known message types.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    /// The payload does not match the shape implied by the type tag.
    #[error("malformed {msg_type} payload: {reason}")]
    MalformedPayload {
        /// Type tag the payload was decoded against.
        msg_type: MessageType,
        /// Decoder diagnostic.
        reason: String,
    },
    /// The envelope header itself could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// An extension key shadows a field defined by the schema.
    #[error("extension key `{0}` shadows a schema field")]
    ReservedExtension(String),
    /// Serialization of an outbound envelope failed.
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::SchemaVersionMismatch { .. } => "schema_version_mismatch",
            ProtocolError::UnknownMessageType(_) => "unknown_message_type",
            ProtocolError::MalformedPayload { .. } => "malformed_payload",
            ProtocolError::MalformedEnvelope(_) => "malformed_envelope",
            ProtocolError::ReservedExtension(_) => "reserved_extension",
            ProtocolError::Encode(_) => "encode",
        }
    }
}

pub use codec::{decode, encode};
pub use logging::{log_envelope, MessageDirection};
pub use types::{
    ControlFrame, Envelope, Extensions, GripCommand, GripMode, Heartbeat, HeartbeatAck,
    MessageType, ObjectPose, Payload, Pose, SimEvent, SimEventPayload, SimState, StateFrame,
    StateStats, UiCmd, UiCommand, RESERVED_KEYS, SCHEMA_VERSION,
};
