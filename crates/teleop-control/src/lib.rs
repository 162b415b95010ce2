//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Turns a raw operator target into a bounded joint-velocity command.
//!
//! The stages run in a fixed order: temporal smoothing, workspace clamp,
//! table clearance, task-space speed limit, damped least-squares IK and a
//! final joint-speed clamp. Clamping stages raise [`SafetyAlert`]s and keep
//! going; nothing in the pipeline aborts on an out-of-range target.

pub mod errors;
pub mod filter;
pub mod frames;
pub mod ik;
pub mod pipeline;
pub mod safety;

pub use errors::{ControlError, Result};
pub use filter::{FilterState, TemporalFilter};
pub use frames::FrameRegistry;
pub use ik::{damped_least_squares, DAMPING_LAMBDA};
pub use pipeline::{ConstrainedTarget, FilterOutput, TargetFilter};
pub use safety::SafetyAlert;

pub use nalgebra::{DMatrix, DVector, Vector3};
