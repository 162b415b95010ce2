//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Session lifecycle and connection orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use nalgebra::Vector3;
use teleop_control::FrameRegistry;
use teleop_msg::{ControlFrame, SimState};

use crate::session::SessionView;

/// Admitted control frame waiting in the command mailbox.
///
/// The target is already expressed in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    pub seq: u64,
    pub t_send_ms: u64,
    /// Receipt time in seconds since the connection opened.
    pub t_s: f64,
    pub target_world: Vector3<f64>,
    pub frame: ControlFrame,
}

/// Why a control frame was not forwarded to the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDrop {
    NoSession,
    NotRunning(SimState),
    ClutchReleased,
    UnknownFrame,
}

impl AdmissionDrop {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDrop::NoSession => "no_session",
            AdmissionDrop::NotRunning(_) => "not_running",
            AdmissionDrop::ClutchReleased => "clutch_released",
            AdmissionDrop::UnknownFrame => "unknown_frame",
        }
    }
}

impl fmt::Display for AdmissionDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDrop::NotRunning(state) => write!(f, "not_running ({state})"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl ControlCommand {
    /// Gate a control frame: a session must exist, be RUNNING, the clutch
    /// must be held and the frame must be known.
    pub fn admit(
        view: &SessionView,
        frames: &FrameRegistry,
        seq: u64,
        t_send_ms: u64,
        t_s: f64,
        frame: ControlFrame,
    ) -> Result<Self, AdmissionDrop> {
        match view.active_state() {
            None => return Err(AdmissionDrop::NoSession),
            Some(SimState::Running) => {}
            Some(state) => return Err(AdmissionDrop::NotRunning(state)),
        }
        if !frame.clutch_enabled {
            return Err(AdmissionDrop::ClutchReleased);
        }
        let target_world = frames
            .resolve(&frame.frame_id, Vector3::from(frame.left_target_pos_m))
            .ok_or(AdmissionDrop::UnknownFrame)?;
        Ok(Self {
            seq,
            t_send_ms,
            t_s,
            target_world,
            frame,
        })
    }
}
