//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tracing::trace;

use crate::types::Envelope;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message written to the operator.
    Outbound,
    /// Message received from the operator.
    Inbound,
}

/// Emit a structured log entry for envelope traffic.
///
/// Logged at trace level because state frames flow at the broadcast rate.
pub fn log_envelope(direction: MessageDirection, envelope: &Envelope) {
    trace!(
        seq = envelope.seq(),
        t_send_ms = envelope.t_send_ms(),
        session_id = envelope.session_id(),
        msg_type = %envelope.msg_type(),
        direction = ?direction,
        "envelope traffic"
    );
}
