//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{ProtocolError, Result};

/// Schema revision compiled into this build. Peers must match it exactly.
pub const SCHEMA_VERSION: &str = "1.0.0-revA";

/// Top-level envelope keys. Extensions may never reuse them.
pub const RESERVED_KEYS: [&str; 7] = [
    "schema_version",
    "msg_type",
    "seq",
    "t_send_ms",
    "session_id",
    "payload",
    "extensions",
];

/// Open extension map carried by every envelope.
pub type Extensions = serde_json::Map<String, JsonValue>;

/// Free-form statistics attached to a state frame.
pub type StateStats = BTreeMap<String, JsonValue>;

/// Type tag selecting the payload variant of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Operator lifecycle command.
    UiCmd,
    /// Operator motion target.
    ControlFrame,
    /// Operator liveness probe.
    Heartbeat,
    /// Server reply to a heartbeat.
    HeartbeatAck,
    /// Server lifecycle notification.
    SimEvent,
    /// Server simulation snapshot.
    StateFrame,
}

impl MessageType {
    /// All message types in declaration order.
    pub const ALL: [MessageType; 6] = [
        MessageType::UiCmd,
        MessageType::ControlFrame,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::SimEvent,
        MessageType::StateFrame,
    ];

    /// Wire tag of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UiCmd => "ui_cmd",
            MessageType::ControlFrame => "control_frame",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::SimEvent => "sim_event",
            MessageType::StateFrame => "state_frame",
        }
    }

    /// Resolve a wire tag, returning `None` for unknown tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle command issued by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UiCommand {
    /// Open a session.
    Connect,
    /// Begin streaming control.
    Start,
    /// Suspend control while keeping the session.
    Pause,
    /// Return robot, objects and filters to their initial state.
    Reset,
    /// Close the session.
    Disconnect,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimState {
    /// Session open, robot holding.
    #[default]
    Idle,
    /// Control frames drive the robot.
    Running,
    /// Control suspended, pause behaviour applied.
    Paused,
    /// Session faulted; only DISCONNECT clears it.
    Error,
}

impl SimState {
    /// Wire spelling of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SimState::Idle => "IDLE",
            SimState::Running => "RUNNING",
            SimState::Paused => "PAUSED",
            SimState::Error => "ERROR",
        }
    }
}

impl fmt::Display for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notification emitted after an accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimEvent {
    /// A session was created.
    Connected,
    /// The session entered RUNNING.
    Started,
    /// The session entered PAUSED.
    Paused,
    /// Scene and filters were reset; the session is IDLE.
    ResetDone,
    /// The session was destroyed.
    Disconnected,
}

/// `ui_cmd` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiCmd {
    /// Requested lifecycle command.
    pub command: UiCommand,
    /// Scene the operator expects the server to have loaded. Empty accepts any.
    #[serde(default)]
    pub requested_scene_config_id: String,
}

/// How the gripper value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GripMode {
    /// Non-zero closes the gripper, zero opens it.
    #[default]
    Binary,
    /// Continuous closure in `[0, 1]`.
    Analog,
}

/// Gripper command attached to a control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GripCommand {
    /// Interpretation of `value`.
    #[serde(default)]
    pub mode: GripMode,
    /// Requested closure.
    pub value: f64,
}

impl GripCommand {
    /// Actuator value in `[0, 1]` for this command.
    pub fn actuator_value(&self) -> f64 {
        match self.mode {
            GripMode::Binary if self.value != 0.0 => 1.0,
            GripMode::Binary => 0.0,
            GripMode::Analog if self.value.is_finite() => self.value.clamp(0.0, 1.0),
            GripMode::Analog => 0.0,
        }
    }
}

/// `control_frame` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Reference frame the target is expressed in.
    pub frame_id: String,
    /// Desired end-effector position in metres.
    pub left_target_pos_m: [f64; 3],
    /// Gripper command.
    pub left_grip: GripCommand,
    /// Operator clutch; frames without it never move the robot.
    pub clutch_enabled: bool,
    /// Client-side alerts, informational only.
    #[serde(default)]
    pub alerts: Vec<String>,
}

/// `heartbeat` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Operator clock at send time, milliseconds since epoch.
    pub t_origin_ms: u64,
}

/// `heartbeat_ack` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Echo of the heartbeat origin timestamp.
    pub t_origin_ms: u64,
    /// Server estimate of the round trip, never negative.
    pub rtt_ms_est: f64,
}

/// `sim_event` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEventPayload {
    /// Event that occurred.
    pub event: SimEvent,
    /// Session state after the event.
    pub sim_state: SimState,
    /// Session the event belongs to.
    pub session_id: String,
}

/// Position and orientation of a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position in metres.
    pub pos_m: [f64; 3],
    /// Orientation quaternion, scalar last.
    pub quat_xyzw: [f64; 4],
}

/// Pose of a tracked object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPose {
    /// Object name from the scene descriptor.
    pub name: String,
    /// Current pose.
    pub pose: Pose,
}

/// `state_frame` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFrame {
    /// Session state when the snapshot was taken.
    pub sim_state: SimState,
    /// Joint positions in radians.
    pub q_rad: Vec<f64>,
    /// Joint velocities in radians per second.
    pub qd_rad_s: Vec<f64>,
    /// End-effector position in metres.
    pub ee_pos_m: [f64; 3],
    /// Tracked object poses.
    #[serde(default)]
    pub objects: Vec<ObjectPose>,
    /// Safety alerts raised while producing the applied command.
    #[serde(default)]
    pub alerts: Vec<String>,
    /// Free-form statistics.
    #[serde(default)]
    pub stats: StateStats,
}

/// Payload variants, one per message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `ui_cmd`
    UiCmd(UiCmd),
    /// `control_frame`
    ControlFrame(ControlFrame),
    /// `heartbeat`
    Heartbeat(Heartbeat),
    /// `heartbeat_ack`
    HeartbeatAck(HeartbeatAck),
    /// `sim_event`
    SimEvent(SimEventPayload),
    /// `state_frame`
    StateFrame(StateFrame),
}

impl Payload {
    /// Type tag matching this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::UiCmd(_) => MessageType::UiCmd,
            Payload::ControlFrame(_) => MessageType::ControlFrame,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
            Payload::HeartbeatAck(_) => MessageType::HeartbeatAck,
            Payload::SimEvent(_) => MessageType::SimEvent,
            Payload::StateFrame(_) => MessageType::StateFrame,
        }
    }

    /// Wire name of the first float field JSON cannot carry (NaN or infinite).
    pub fn non_finite_field(&self) -> Option<&'static str> {
        fn finite(values: &[f64]) -> bool {
            values.iter().all(|v| v.is_finite())
        }

        match self {
            Payload::ControlFrame(frame) => {
                if !finite(&frame.left_target_pos_m) {
                    Some("left_target_pos_m")
                } else if !frame.left_grip.value.is_finite() {
                    Some("left_grip.value")
                } else {
                    None
                }
            }
            Payload::HeartbeatAck(ack) => (!ack.rtt_ms_est.is_finite()).then_some("rtt_ms_est"),
            Payload::StateFrame(state) => {
                if !finite(&state.q_rad) {
                    Some("q_rad")
                } else if !finite(&state.qd_rad_s) {
                    Some("qd_rad_s")
                } else if !finite(&state.ee_pos_m) {
                    Some("ee_pos_m")
                } else if state
                    .objects
                    .iter()
                    .any(|o| !finite(&o.pose.pos_m) || !finite(&o.pose.quat_xyzw))
                {
                    Some("objects.pose")
                } else {
                    None
                }
            }
            Payload::UiCmd(_) | Payload::Heartbeat(_) | Payload::SimEvent(_) => None,
        }
    }
}

/// The only unit ever sent over the wire.
///
/// Envelopes are immutable; the schema version is implied by construction
/// because the codec refuses any other revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    seq: u64,
    t_send_ms: u64,
    session_id: String,
    payload: Payload,
    extensions: Extensions,
}

impl Envelope {
    /// Construct an envelope without extensions.
    pub fn new(seq: u64, t_send_ms: u64, session_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            seq,
            t_send_ms,
            session_id: session_id.into(),
            payload,
            extensions: Extensions::new(),
        }
    }

    /// Attach extensions, rejecting keys reserved by the schema.
    pub fn with_extensions(mut self, extensions: Extensions) -> Result<Self> {
        if let Some(key) = extensions
            .keys()
            .find(|key| RESERVED_KEYS.contains(&key.as_str()))
        {
            return Err(ProtocolError::ReservedExtension(key.clone()));
        }
        self.extensions = extensions;
        Ok(self)
    }

    /// Schema revision of the envelope.
    pub fn schema_version(&self) -> &'static str {
        SCHEMA_VERSION
    }

    /// Type tag derived from the payload.
    pub fn msg_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Sender sequence number. Ordering hint only.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Sender clock at send time, milliseconds since epoch.
    pub fn t_send_ms(&self) -> u64 {
        self.t_send_ms
    }

    /// Session identifier, empty before CONNECT.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Typed payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consume the envelope, returning its payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Extension map.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }
}
