//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Session lifecycle and connection orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::RwLock;
use teleop_msg::{SimEvent, SimState, UiCmd, UiCommand};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Heartbeat bookkeeping for the current connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkStats {
    /// Server receipt time of the last heartbeat.
    pub last_heartbeat_at: Option<Instant>,
    /// Round-trip estimate computed from the last heartbeat.
    pub rtt_ms_est: Option<f64>,
}

/// Read-only copy of the session published to the other loops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    pub session_id: Option<String>,
    pub state: SimState,
    /// Incremented on every accepted RESET.
    pub reset_epoch: u64,
    pub link: LinkStats,
}

impl SessionView {
    /// State while a session exists, `None` otherwise.
    pub fn active_state(&self) -> Option<SimState> {
        self.session_id.as_ref().map(|_| self.state)
    }
}

/// Shared handle to the published [`SessionView`].
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<RwLock<SessionView>>);

impl SessionHandle {
    pub fn snapshot(&self) -> SessionView {
        self.0.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut SessionView)) {
        f(&mut self.0.write());
    }
}

/// Accepted transition and the event to announce.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: SimEvent,
    /// State after the transition. `IDLE` after DISCONNECT.
    pub state: SimState,
    /// Session the event belongs to; the discarded id after DISCONNECT.
    pub session_id: String,
    /// Whether the physics scene and filter must be reset.
    pub reset_requested: bool,
}

/// Reasons a `ui_cmd` is refused without an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("no active session")]
    NoSession,
    #[error("a session is already active")]
    AlreadyConnected,
    #[error("{command:?} is not valid from {from}")]
    InvalidFrom { from: SimState, command: UiCommand },
    #[error("session is faulted; only DISCONNECT is accepted")]
    Faulted,
}

#[derive(Debug)]
struct Session {
    id: String,
    state: SimState,
}

/// Lifecycle of the single session carried by a connection.
///
/// Only the receive loop holds the machine; every change is mirrored into
/// the [`SessionHandle`] before `apply` returns.
#[derive(Debug)]
pub struct SessionMachine {
    scene_id: String,
    session: Option<Session>,
    shared: SessionHandle,
}

impl SessionMachine {
    pub fn new(scene_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            session: None,
            shared: SessionHandle::default(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.shared.clone()
    }

    pub fn state(&self) -> Option<SimState> {
        self.session.as_ref().map(|session| session.state)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.id.as_str())
    }

    /// Apply one operator command.
    pub fn apply(&mut self, cmd: &UiCmd) -> Result<Transition, Rejected> {
        let transition = match cmd.command {
            UiCommand::Connect => self.connect(&cmd.requested_scene_config_id)?,
            UiCommand::Disconnect => {
                let session = self.session.take().ok_or(Rejected::NoSession)?;
                Transition {
                    event: SimEvent::Disconnected,
                    state: SimState::Idle,
                    session_id: session.id,
                    reset_requested: false,
                }
            }
            command => {
                let session = self.session.as_mut().ok_or(Rejected::NoSession)?;
                if session.state == SimState::Error {
                    return Err(Rejected::Faulted);
                }
                match (command, session.state) {
                    (UiCommand::Start, SimState::Idle | SimState::Paused) => {
                        session.state = SimState::Running;
                        transition(SimEvent::Started, session, false)
                    }
                    (UiCommand::Pause, SimState::Running) => {
                        session.state = SimState::Paused;
                        transition(SimEvent::Paused, session, false)
                    }
                    (UiCommand::Reset, _) => {
                        session.state = SimState::Idle;
                        transition(SimEvent::ResetDone, session, true)
                    }
                    (command, from) => return Err(Rejected::InvalidFrom { from, command }),
                }
            }
        };

        self.publish(transition.reset_requested);
        info!(
            session_id = %transition.session_id,
            command = ?cmd.command,
            event = ?transition.event,
            state = %transition.state,
            "session transition"
        );
        Ok(transition)
    }

    fn connect(&mut self, requested_scene: &str) -> Result<Transition, Rejected> {
        if self.session.is_some() {
            return Err(Rejected::AlreadyConnected);
        }
        let id = Uuid::new_v4().to_string();
        let state = if requested_scene.is_empty() || requested_scene == self.scene_id {
            SimState::Idle
        } else {
            warn!(
                session_id = %id,
                requested_scene,
                loaded_scene = %self.scene_id,
                "operator requested a different scene; session faulted"
            );
            SimState::Error
        };
        self.session = Some(Session {
            id: id.clone(),
            state,
        });
        Ok(Transition {
            event: SimEvent::Connected,
            state,
            session_id: id,
            reset_requested: false,
        })
    }

    /// Record a heartbeat round-trip estimate.
    pub fn record_heartbeat(&mut self, rtt_ms_est: f64) {
        self.shared.update(|view| {
            view.link = LinkStats {
                last_heartbeat_at: Some(Instant::now()),
                rtt_ms_est: Some(rtt_ms_est),
            };
        });
    }

    /// Destroy the session when the transport goes away. Returns the discarded id.
    pub fn tear_down(&mut self) -> Option<String> {
        let id = self.session.take().map(|session| session.id);
        self.publish(false);
        self.shared.update(|view| view.link = LinkStats::default());
        id
    }

    fn publish(&self, bump_reset: bool) {
        let session_id = self.session.as_ref().map(|s| s.id.clone());
        let state = self.state().unwrap_or_default();
        self.shared.update(|view| {
            view.session_id = session_id;
            view.state = state;
            if bump_reset {
                view.reset_epoch += 1;
            }
        });
    }
}

fn transition(event: SimEvent, session: &Session, reset_requested: bool) -> Transition {
    Transition {
        event,
        state: session.state,
        session_id: session.id.clone(),
        reset_requested,
    }
}
