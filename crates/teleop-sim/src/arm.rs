//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Physics collaborator interface and reference engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Kinematic serial arm: a base yaw joint followed by pitch joints.
//!
//! Joints are velocity-controlled and integrate exactly (`q += qd * dt`).
//! Tracked bodies are static; they only move when placed.

use std::time::Duration;

use indexmap::IndexMap;
use nalgebra::{DMatrix, Vector3};
use teleop_common::SceneConfig;
use tracing::debug;

use crate::engine::{ActuatorId, BodyPose, JointState, PhysicsEngine};
use crate::errors::{PhysicsError, Result};

const COLUMN_HEIGHT_M: f64 = 0.2;
const SEGMENT_LENGTH_M: f64 = 0.3;
const JACOBIAN_STEP: f64 = 1e-6;

/// Default segment lengths for `joints` joints: a short column then equal segments.
pub fn default_link_lengths(joints: usize) -> Vec<f64> {
    (0..joints)
        .map(|i| if i == 0 { COLUMN_HEIGHT_M } else { SEGMENT_LENGTH_M })
        .collect()
}

#[derive(Debug, Clone)]
pub struct KinematicArm {
    base: Vector3<f64>,
    links: Vec<f64>,
    ee_site: String,
    gripper_actuator: String,
    q: Vec<f64>,
    qd: Vec<f64>,
    qd_cmd: Vec<f64>,
    gripper: f64,
    bodies: IndexMap<String, BodyPose>,
    sim_time: Duration,
}

impl KinematicArm {
    /// Build the arm at its home configuration with every tracked object at its initial pose.
    pub fn from_config(scene: &SceneConfig) -> Self {
        let robot = &scene.robot;
        let joints = robot.home_q.len();
        let links = if robot.link_lengths_m.is_empty() {
            default_link_lengths(joints)
        } else {
            robot.link_lengths_m.clone()
        };
        let bodies = scene
            .objects
            .iter()
            .map(|object| (object.name.clone(), BodyPose::from_config(&object.pose)))
            .collect();
        Self {
            base: Vector3::from(robot.base_pos_m),
            links,
            ee_site: robot.ee_site.clone(),
            gripper_actuator: robot.gripper.actuator_name.clone(),
            q: robot.home_q.clone(),
            qd: vec![0.0; joints],
            qd_cmd: vec![0.0; joints],
            gripper: 0.0,
            bodies,
            sim_time: Duration::ZERO,
        }
    }

    pub fn joint_count(&self) -> usize {
        self.q.len()
    }

    /// Last value written to the gripper actuator, in `[0, 1]`.
    pub fn gripper(&self) -> f64 {
        self.gripper
    }

    /// Joint velocity commands currently applied.
    pub fn commanded_velocities(&self) -> &[f64] {
        &self.qd_cmd
    }

    /// End-effector position for joint positions `q`.
    pub fn forward_kinematics(&self, q: &[f64]) -> Vector3<f64> {
        let yaw = q.first().copied().unwrap_or(0.0);
        let column = self.links.first().copied().unwrap_or(0.0);
        let mut radial = 0.0;
        let mut height = column;
        let mut elevation = 0.0;
        for (angle, length) in q.iter().zip(self.links.iter()).skip(1) {
            elevation += angle;
            radial += length * elevation.cos();
            height += length * elevation.sin();
        }
        self.base + Vector3::new(radial * yaw.cos(), radial * yaw.sin(), height)
    }

    fn check_site(&self, site: &str) -> Result<()> {
        if site == self.ee_site {
            Ok(())
        } else {
            Err(PhysicsError::UnknownSite(site.to_owned()))
        }
    }
}

impl PhysicsEngine for KinematicArm {
    fn advance(&mut self, dt: Duration) -> Result<()> {
        let step = dt.as_secs_f64();
        for ((q, qd), cmd) in self.q.iter_mut().zip(self.qd.iter_mut()).zip(&self.qd_cmd) {
            *qd = *cmd;
            *q += cmd * step;
        }
        if self.q.iter().any(|q| !q.is_finite()) {
            return Err(PhysicsError::Fault("joint state diverged".into()));
        }
        self.sim_time += dt;
        Ok(())
    }

    fn read_joint_state(&self) -> JointState {
        JointState {
            positions: self.q.clone(),
            velocities: self.qd.clone(),
        }
    }

    fn read_site_pose(&self, site: &str) -> Result<Vector3<f64>> {
        self.check_site(site)?;
        Ok(self.forward_kinematics(&self.q))
    }

    fn read_body_pose(&self, body: &str) -> Result<BodyPose> {
        self.bodies
            .get(body)
            .copied()
            .ok_or_else(|| PhysicsError::UnknownBody(body.to_owned()))
    }

    fn compute_jacobian(&self, site: &str) -> Result<DMatrix<f64>> {
        self.check_site(site)?;
        let joints = self.q.len();
        let mut jacobian = DMatrix::zeros(3, joints);
        let mut probe = self.q.clone();
        for joint in 0..joints {
            let original = probe[joint];
            probe[joint] = original + JACOBIAN_STEP;
            let ahead = self.forward_kinematics(&probe);
            probe[joint] = original - JACOBIAN_STEP;
            let behind = self.forward_kinematics(&probe);
            probe[joint] = original;
            let column = (ahead - behind) / (2.0 * JACOBIAN_STEP);
            jacobian.set_column(joint, &column);
        }
        Ok(jacobian)
    }

    fn write_actuator_command(&mut self, actuator: &ActuatorId, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(PhysicsError::NonFinite(actuator.to_string()));
        }
        match actuator {
            ActuatorId::Joint(index) => {
                let slot = self
                    .qd_cmd
                    .get_mut(*index)
                    .ok_or_else(|| PhysicsError::UnknownActuator(actuator.to_string()))?;
                *slot = value;
            }
            ActuatorId::Named(name) if *name == self.gripper_actuator => {
                self.gripper = value.clamp(0.0, 1.0);
            }
            ActuatorId::Named(name) => return Err(PhysicsError::UnknownActuator(name.clone())),
        }
        Ok(())
    }

    fn reset_to_home(&mut self, joint_targets: &[f64]) -> Result<()> {
        if joint_targets.len() != self.q.len() {
            return Err(PhysicsError::JointCountMismatch {
                expected: self.q.len(),
                actual: joint_targets.len(),
            });
        }
        self.q.copy_from_slice(joint_targets);
        self.qd.iter_mut().for_each(|v| *v = 0.0);
        self.qd_cmd.iter_mut().for_each(|v| *v = 0.0);
        self.gripper = 0.0;
        debug!(joints = self.q.len(), "arm reset to home");
        Ok(())
    }

    fn place_body(&mut self, body: &str, pose: BodyPose) -> Result<()> {
        let slot = self
            .bodies
            .get_mut(body)
            .ok_or_else(|| PhysicsError::UnknownBody(body.to_owned()))?;
        *slot = pose;
        Ok(())
    }

    fn sim_time(&self) -> Duration {
        self.sim_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn scene() -> SceneConfig {
        r#"
scene_id = "arm"

[robot]
home_q = [0.0, 0.0, 0.0]
link_lengths_m = [0.2, 0.3, 0.3]
base_pos_m = [0.0, 0.0, 1.0]

[[objects]]
name = "cube"
pose = { pos_m = [0.5, 0.0, 1.025], quat_xyzw = [0.0, 0.0, 0.0, 1.0] }
"#
        .parse()
        .unwrap()
    }

    #[test]
    fn straight_arm_reaches_along_x() {
        let arm = KinematicArm::from_config(&scene());
        let ee = arm.read_site_pose("ee_site").unwrap();
        assert!((ee - Vector3::new(0.6, 0.0, 1.2)).norm() < 1e-12);
    }

    #[test]
    fn yaw_rotates_about_the_base() {
        let arm = KinematicArm::from_config(&scene());
        let ee = arm.forward_kinematics(&[std::f64::consts::FRAC_PI_2, 0.0, 0.0]);
        assert!((ee - Vector3::new(0.0, 0.6, 1.2)).norm() < 1e-12);
    }

    #[test]
    fn numeric_jacobian_matches_analytic_columns() {
        let arm = KinematicArm::from_config(&scene());
        let jacobian = arm.compute_jacobian("ee_site").unwrap();
        // Yaw moves the straight arm along +y, pitch joints lift it along +z.
        assert!((jacobian[(1, 0)] - 0.6).abs() < 1e-6);
        assert!((jacobian[(2, 1)] - 0.6).abs() < 1e-6);
        assert!((jacobian[(2, 2)] - 0.3).abs() < 1e-6);
        assert!(jacobian[(0, 1)].abs() < 1e-6);
    }

    #[test]
    fn velocity_commands_integrate() {
        let mut arm = KinematicArm::from_config(&scene());
        arm.write_actuator_command(&ActuatorId::Joint(1), 0.5).unwrap();
        arm.advance(Duration::from_millis(100)).unwrap();
        let state = arm.read_joint_state();
        assert!((state.positions[1] - 0.05).abs() < 1e-12);
        assert_eq!(state.velocities[1], 0.5);
        assert_eq!(arm.sim_time(), Duration::from_millis(100));
    }

    #[test]
    fn reset_restores_home_and_clears_commands() {
        let mut arm = KinematicArm::from_config(&scene());
        arm.write_actuator_command(&ActuatorId::Joint(0), 1.0).unwrap();
        arm.write_actuator_command(&ActuatorId::Named("gripper".into()), 1.0)
            .unwrap();
        arm.advance(Duration::from_secs(1)).unwrap();
        arm.reset_to_home(&[0.0, 0.0, 0.0]).unwrap();
        assert_eq!(arm.read_joint_state().positions, vec![0.0, 0.0, 0.0]);
        assert_eq!(arm.commanded_velocities(), &[0.0, 0.0, 0.0]);
        assert_eq!(arm.gripper(), 0.0);
        assert_eq!(
            arm.reset_to_home(&[0.0]),
            Err(PhysicsError::JointCountMismatch {
                expected: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn bodies_can_be_placed_and_read() {
        let mut arm = KinematicArm::from_config(&scene());
        let pose = BodyPose {
            position: Vector3::new(0.1, 0.2, 1.1),
            orientation: UnitQuaternion::identity(),
        };
        arm.place_body("cube", pose).unwrap();
        assert_eq!(arm.read_body_pose("cube").unwrap(), pose);
        assert!(matches!(
            arm.read_body_pose("sphere"),
            Err(PhysicsError::UnknownBody(_))
        ));
    }

    #[test]
    fn unknown_actuators_and_sites_are_errors() {
        let mut arm = KinematicArm::from_config(&scene());
        assert!(arm
            .write_actuator_command(&ActuatorId::Joint(7), 0.1)
            .is_err());
        assert!(arm
            .write_actuator_command(&ActuatorId::Joint(0), f64::NAN)
            .is_err());
        assert!(arm.read_site_pose("wrist").is_err());
    }
}
