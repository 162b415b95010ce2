//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Session lifecycle and connection orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Session lifecycle and the per-connection orchestrator.
//!
//! A [`SessionOrchestrator`] owns one operator connection and runs three
//! tokio tasks: the receive loop (sole writer of the [`SessionMachine`]),
//! the control tick (sole user of the physics engine) and the state
//! broadcaster. They share nothing but the session view and the mailboxes.

pub mod command;
pub mod orchestrator;
pub mod session;

pub use command::{AdmissionDrop, ControlCommand};
pub use orchestrator::{
    CloseReason, ConnectionIo, ControlTick, Finished, OrchestratorError, SessionOrchestrator,
    TransportError, OUTBOUND_QUEUE_DEPTH,
};
pub use session::{LinkStats, Rejected, SessionHandle, SessionMachine, SessionView, Transition};

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
