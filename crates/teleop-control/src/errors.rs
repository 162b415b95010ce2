//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("jacobian must be 3xN, got {rows}x{cols}")]
    JacobianShape { rows: usize, cols: usize },
    #[error("jacobian contains non-finite entries")]
    NonFiniteJacobian,
    #[error("target {0:?} is not finite")]
    NonFiniteTarget([f64; 3]),
    #[error("end-effector position {0:?} is not finite")]
    NonFiniteEndEffector([f64; 3]),
}
