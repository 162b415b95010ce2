//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Physics collaborator interface and reference engine exports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Narrow interface to the physics integrator driven by the control tick.
//!
//! The server only ever advances time, reads joint and body state, asks for a
//! positional Jacobian and writes actuator commands. [`KinematicArm`] is a
//! self-contained implementation used by the daemon and the test suites.

pub mod arm;
pub mod engine;
pub mod errors;

pub use arm::KinematicArm;
pub use engine::{ActuatorId, BodyPose, JointState, PhysicsEngine};
pub use errors::{PhysicsError, Result};
