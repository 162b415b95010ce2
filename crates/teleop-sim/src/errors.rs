//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Physics collaborator interface and reference engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PhysicsError>;

/// Faults reported by a physics engine. Every variant is fatal to the server.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PhysicsError {
    #[error("unknown site '{0}'")]
    UnknownSite(String),
    #[error("unknown body '{0}'")]
    UnknownBody(String),
    #[error("unknown actuator '{0}'")]
    UnknownActuator(String),
    #[error("expected {expected} joint values, got {actual}")]
    JointCountMismatch { expected: usize, actual: usize },
    #[error("non-finite value written to {0}")]
    NonFinite(String),
    #[error("physics engine fault: {0}")]
    Fault(String),
}
