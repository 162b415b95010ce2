//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use nalgebra::{DVector, Vector3};
use teleop_common::WorkspaceBox;

/// Raised when a stage had to modify the operator's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyAlert {
    WorkspaceLimit,
    TableClearance,
}

impl SafetyAlert {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyAlert::WorkspaceLimit => "WORKSPACE_LIMIT",
            SafetyAlert::TableClearance => "TABLE_CLEARANCE",
        }
    }
}

impl fmt::Display for SafetyAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp `target` into the box. Returns the clamped point and whether any axis moved.
pub fn clamp_to_workspace(target: Vector3<f64>, workspace: &WorkspaceBox) -> (Vector3<f64>, bool) {
    let mut clamped = target;
    for axis in 0..3 {
        clamped[axis] = target[axis].clamp(workspace.min[axis], workspace.max[axis]);
    }
    (clamped, clamped != target)
}

/// Raise z to `floor_m` if it sits below it.
pub fn enforce_table_clearance(target: Vector3<f64>, floor_m: f64) -> (Vector3<f64>, bool) {
    if target.z < floor_m {
        (Vector3::new(target.x, target.y, floor_m), true)
    } else {
        (target, false)
    }
}

/// Task-space velocity along `error`, proportional to its length and capped at `max_speed`.
pub fn limit_task_speed(error: Vector3<f64>, gain: f64, max_speed: f64) -> Vector3<f64> {
    let distance = error.norm();
    if !distance.is_finite() || distance <= f64::EPSILON {
        return Vector3::zeros();
    }
    let speed = (distance * gain).min(max_speed);
    error * (speed / distance)
}

/// Clamp every component into `[-max, max]`. Non-finite components become zero.
pub fn clamp_joint_speeds(dq: &mut DVector<f64>, max: f64) {
    for value in dq.iter_mut() {
        *value = if value.is_finite() {
            value.clamp(-max, max)
        } else {
            0.0
        };
    }
}
