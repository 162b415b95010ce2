//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! JSON codec for [`Envelope`].
//!
//! Decoding checks, in order: the text is a JSON object, the schema version
//! matches, the type tag is known, the header fields are well formed, the
//! payload matches the tag, and no extension shadows a schema field.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::types::{Envelope, Extensions, MessageType, Payload, SCHEMA_VERSION};
use crate::{ProtocolError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    schema_version: String,
    msg_type: String,
    seq: u64,
    t_send_ms: u64,
    #[serde(default)]
    session_id: String,
    payload: JsonValue,
    #[serde(default)]
    extensions: Extensions,
}

/// Encode an envelope into its canonical JSON text.
///
/// NaN and infinite floats are refused: JSON has no spelling for them and
/// `serde_json` would write `null`, which [`decode`] then rejects.
pub fn encode(envelope: &Envelope) -> Result<String> {
    if let Some(field) = envelope.payload().non_finite_field() {
        return Err(ProtocolError::Encode(format!(
            "`{field}` of {} is not a finite number",
            envelope.msg_type()
        )));
    }
    let payload = match envelope.payload() {
        Payload::UiCmd(p) => serde_json::to_value(p),
        Payload::ControlFrame(p) => serde_json::to_value(p),
        Payload::Heartbeat(p) => serde_json::to_value(p),
        Payload::HeartbeatAck(p) => serde_json::to_value(p),
        Payload::SimEvent(p) => serde_json::to_value(p),
        Payload::StateFrame(p) => serde_json::to_value(p),
    }
    .map_err(|err| ProtocolError::Encode(err.to_string()))?;

    let wire = WireEnvelope {
        schema_version: SCHEMA_VERSION.to_owned(),
        msg_type: envelope.msg_type().as_str().to_owned(),
        seq: envelope.seq(),
        t_send_ms: envelope.t_send_ms(),
        session_id: envelope.session_id().to_owned(),
        payload,
        extensions: envelope.extensions().clone(),
    };
    serde_json::to_string(&wire).map_err(|err| ProtocolError::Encode(err.to_string()))
}

/// Decode JSON text into an envelope.
pub fn decode(text: &str) -> Result<Envelope> {
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|err| ProtocolError::MalformedEnvelope(err.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(ProtocolError::MalformedEnvelope(
            "envelope must be a JSON object".into(),
        ));
    };

    let version = header_str(object, "schema_version")?;
    if version != SCHEMA_VERSION {
        return Err(ProtocolError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            found: version.to_owned(),
        });
    }
    let tag = header_str(object, "msg_type")?;
    let msg_type =
        MessageType::from_tag(tag).ok_or_else(|| ProtocolError::UnknownMessageType(tag.to_owned()))?;

    let wire: WireEnvelope = serde_json::from_value(value)
        .map_err(|err| ProtocolError::MalformedEnvelope(err.to_string()))?;
    let payload = decode_payload(msg_type, wire.payload)?;

    Envelope::new(wire.seq, wire.t_send_ms, wire.session_id, payload)
        .with_extensions(wire.extensions)
}

fn header_str<'a>(object: &'a serde_json::Map<String, JsonValue>, key: &str) -> Result<&'a str> {
    object
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ProtocolError::MalformedEnvelope(format!("missing string field `{key}`")))
}

fn decode_payload(msg_type: MessageType, payload: JsonValue) -> Result<Payload> {
    Ok(match msg_type {
        MessageType::UiCmd => Payload::UiCmd(payload_as(msg_type, payload)?),
        MessageType::ControlFrame => Payload::ControlFrame(payload_as(msg_type, payload)?),
        MessageType::Heartbeat => Payload::Heartbeat(payload_as(msg_type, payload)?),
        MessageType::HeartbeatAck => Payload::HeartbeatAck(payload_as(msg_type, payload)?),
        MessageType::SimEvent => Payload::SimEvent(payload_as(msg_type, payload)?),
        MessageType::StateFrame => Payload::StateFrame(payload_as(msg_type, payload)?),
    })
}

fn payload_as<T: DeserializeOwned>(msg_type: MessageType, payload: JsonValue) -> Result<T> {
    serde_json::from_value(payload).map_err(|err| ProtocolError::MalformedPayload {
        msg_type,
        reason: err.to_string(),
    })
}
