//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use nalgebra::{DMatrix, DVector, Vector3};
use teleop_common::{ControlLimits, PauseBehavior, SceneConfig};
use tracing::debug;

use crate::errors::{ControlError, Result};
use crate::filter::{FilterState, TemporalFilter};
use crate::ik::{damped_least_squares, DAMPING_LAMBDA};
use crate::safety::{
    clamp_joint_speeds, clamp_to_workspace, enforce_table_clearance, limit_task_speed,
    SafetyAlert,
};

/// Target after smoothing, workspace clamp and table clearance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstrainedTarget {
    pub target: Vector3<f64>,
    pub alerts: Vec<SafetyAlert>,
}

/// Result of running every stage for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutput {
    pub safe_target: Vector3<f64>,
    pub joint_velocities: DVector<f64>,
    pub alerts: Vec<SafetyAlert>,
}

/// Safety-constrained target filter built from the scene's control section.
///
/// The filter is stateless apart from the [`FilterState`] passed in by the
/// caller, which owns it and resets it on RESET.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    temporal: TemporalFilter,
    limits: ControlLimits,
    table_floor_m: f64,
    position_gain: f64,
    pause_behavior: PauseBehavior,
    pause_damping: f64,
}

impl TargetFilter {
    pub fn from_config(scene: &SceneConfig) -> Self {
        let control = &scene.control;
        Self {
            temporal: TemporalFilter::from_config(&control.filter),
            limits: control.limits.clone(),
            table_floor_m: scene.table_floor_m(),
            position_gain: control.position_gain,
            pause_behavior: control.pause_behavior,
            pause_damping: control.pause_damping,
        }
    }

    pub fn limits(&self) -> &ControlLimits {
        &self.limits
    }

    /// Stages 1 to 3: smoothing, workspace clamp, table clearance.
    pub fn constrain_target(
        &self,
        state: &mut FilterState,
        raw: Vector3<f64>,
        t_s: f64,
    ) -> Result<ConstrainedTarget> {
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(ControlError::NonFiniteTarget([raw.x, raw.y, raw.z]));
        }
        let mut alerts = Vec::new();
        let smoothed = self.temporal.apply(state, raw, t_s);

        let (target, clamped) = clamp_to_workspace(smoothed, &self.limits.workspace_aabb_m);
        if clamped {
            debug!(x = smoothed.x, y = smoothed.y, z = smoothed.z, "target clamped into workspace");
            alerts.push(SafetyAlert::WorkspaceLimit);
        }

        let (target, raised) = enforce_table_clearance(target, self.table_floor_m);
        if raised {
            debug!(floor_m = self.table_floor_m, "target raised to table clearance");
            alerts.push(SafetyAlert::TableClearance);
        }

        Ok(ConstrainedTarget { target, alerts })
    }

    /// Stages 4 to 6: task-space speed limit, damped least-squares IK, joint clamp.
    pub fn track(
        &self,
        target: Vector3<f64>,
        ee_pos: Vector3<f64>,
        jacobian: &DMatrix<f64>,
    ) -> Result<DVector<f64>> {
        if ee_pos.iter().any(|v| !v.is_finite()) {
            return Err(ControlError::NonFiniteEndEffector([ee_pos.x, ee_pos.y, ee_pos.z]));
        }
        let v_desired = limit_task_speed(
            target - ee_pos,
            self.position_gain,
            self.limits.max_ee_speed_mps,
        );
        let mut dq = damped_least_squares(jacobian, &v_desired, DAMPING_LAMBDA)?;
        clamp_joint_speeds(&mut dq, self.limits.max_joint_speed_rad_s);
        Ok(dq)
    }

    /// Run all six stages for one command.
    pub fn apply(
        &self,
        state: &mut FilterState,
        raw: Vector3<f64>,
        t_s: f64,
        ee_pos: Vector3<f64>,
        jacobian: &DMatrix<f64>,
    ) -> Result<FilterOutput> {
        let ConstrainedTarget { target, alerts } = self.constrain_target(state, raw, t_s)?;
        let joint_velocities = self.track(target, ee_pos, jacobian)?;
        Ok(FilterOutput {
            safe_target: target,
            joint_velocities,
            alerts,
        })
    }

    /// Joint-velocity command while PAUSED, given the current joint velocities.
    pub fn pause_command(&self, qd: &[f64]) -> DVector<f64> {
        match self.pause_behavior {
            PauseBehavior::Hold => DVector::zeros(qd.len()),
            PauseBehavior::Damp => {
                let mut dq = DVector::from_iterator(
                    qd.len(),
                    qd.iter().map(|v| v * self.pause_damping),
                );
                clamp_joint_speeds(&mut dq, self.limits.max_joint_speed_rad_s);
                dq
            }
        }
    }
}
