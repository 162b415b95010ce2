//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Physics collaborator interface and reference engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use nalgebra::{DMatrix, Quaternion, UnitQuaternion, Vector3};
use teleop_common::PoseConfig;

use crate::errors::Result;

/// Joint positions (rad) and velocities (rad/s), one entry per actuated joint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointState {
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
}

/// World pose of a body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyPose {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

impl BodyPose {
    pub fn from_config(pose: &PoseConfig) -> Self {
        let [x, y, z, w] = pose.quat_xyzw;
        Self {
            position: Vector3::from(pose.pos_m),
            orientation: UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
        }
    }

    pub fn position_array(&self) -> [f64; 3] {
        [self.position.x, self.position.y, self.position.z]
    }

    /// Orientation as `[x, y, z, w]`.
    pub fn quat_xyzw(&self) -> [f64; 4] {
        let q = self.orientation.quaternion();
        [q.i, q.j, q.k, q.w]
    }
}

/// Actuator addressed by a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActuatorId {
    /// Velocity actuator of the arm joint at this index.
    Joint(usize),
    /// Actuator declared by name in the scene, such as the gripper.
    Named(String),
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorId::Joint(index) => write!(f, "joint[{index}]"),
            ActuatorId::Named(name) => f.write_str(name),
        }
    }
}

/// Operations the control tick needs from a physics integrator.
///
/// Only the control tick holds the engine, so implementations need not be `Sync`.
pub trait PhysicsEngine: Send {
    /// Integrate the scene forward by `dt`.
    fn advance(&mut self, dt: Duration) -> Result<()>;

    fn read_joint_state(&self) -> JointState;

    /// World position of a named site.
    fn read_site_pose(&self, site: &str) -> Result<Vector3<f64>>;

    fn read_body_pose(&self, body: &str) -> Result<BodyPose>;

    /// Positional Jacobian (3xN) of a site with respect to the joints.
    fn compute_jacobian(&self, site: &str) -> Result<DMatrix<f64>>;

    fn write_actuator_command(&mut self, actuator: &ActuatorId, value: f64) -> Result<()>;

    /// Put the joints at `joint_targets` with zero velocity and clear actuator commands.
    fn reset_to_home(&mut self, joint_targets: &[f64]) -> Result<()>;

    fn place_body(&mut self, body: &str, pose: BodyPose) -> Result<()>;

    /// Simulated time elapsed since construction.
    fn sim_time(&self) -> Duration;
}
