//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use indexmap::IndexMap;
use nalgebra::{Matrix4, Vector3, Vector4};
use teleop_common::{FrameConfig, WORLD_FRAME_ALIASES};

/// Named operator frames and their transforms into the simulation world.
#[derive(Debug, Clone, Default)]
pub struct FrameRegistry {
    frames: HashMap<String, Matrix4<f64>>,
}

impl FrameRegistry {
    pub fn from_config(frames: &IndexMap<String, FrameConfig>) -> Self {
        let frames = frames
            .iter()
            .map(|(name, frame)| (name.clone(), Matrix4::from_row_slice(&frame.t_sim_from_frame)))
            .collect();
        Self { frames }
    }

    /// Express `point` in world coordinates. `None` for unknown frames.
    pub fn resolve(&self, frame_id: &str, point: Vector3<f64>) -> Option<Vector3<f64>> {
        if WORLD_FRAME_ALIASES.contains(&frame_id) {
            return Some(point);
        }
        let transform = self.frames.get(frame_id)?;
        let h = transform * Vector4::new(point.x, point.y, point.z, 1.0);
        Some(Vector3::new(h.x, h.y, h.z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FrameRegistry {
        let mut frames = IndexMap::new();
        frames.insert(
            "vp_operator_anchor".to_string(),
            FrameConfig {
                // 90 degrees about z, then lifted onto the table.
                t_sim_from_frame: [
                    0.0, -1.0, 0.0, 0.5, //
                    1.0, 0.0, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 1.0, //
                    0.0, 0.0, 0.0, 1.0,
                ],
            },
        );
        FrameRegistry::from_config(&frames)
    }

    #[test]
    fn world_aliases_are_identity() {
        let registry = registry();
        let p = Vector3::new(0.1, 0.2, 0.3);
        for alias in ["", "world", "sim"] {
            assert_eq!(registry.resolve(alias, p), Some(p));
        }
    }

    #[test]
    fn configured_frames_apply_the_transform() {
        let out = registry()
            .resolve("vp_operator_anchor", Vector3::new(0.1, 0.0, 0.05))
            .unwrap();
        assert!((out - Vector3::new(0.5, 0.1, 1.05)).norm() < 1e-12);
    }

    #[test]
    fn unknown_frames_do_not_resolve() {
        let registry = registry();
        assert_eq!(registry.resolve("head", Vector3::zeros()), None);
    }
}
