//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration tests for scene configuration loading."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::time::Duration;

use teleop_common::{FilterConfig, PauseBehavior, SceneConfig};

const SCENE_TOML: &str = r#"
schema_version = "1.0.0-revA"
scene_id = "table_pick"

[networking]
ws_host = "127.0.0.1"
ws_port = 9001
ws_path = "/teleop"

[frames.vp_operator_anchor]
t_sim_from_frame = [1.0, 0.0, 0.0, 0.5,
                    0.0, 1.0, 0.0, 0.0,
                    0.0, 0.0, 1.0, 1.0,
                    0.0, 0.0, 0.0, 1.0]

[robot]
home_q = [0.0, 0.5, -1.0, 0.5]
link_lengths_m = [0.2, 0.35, 0.3, 0.15]
ee_site = "tool0"

[table]
top_height_m = 0.75

[[objects]]
name = "cube"
type = "box"
size_m = [0.05, 0.05, 0.05]
pose = { pos_m = [0.5, 0.0, 0.775], quat_xyzw = [0.0, 0.0, 0.0, 1.0] }

[control]
pause_behavior = "damp"
pause_damping = 0.8

[control.limits]
max_ee_speed_mps = 0.3
table_clearance_m = 0.01

[control.limits.workspace_aabb_m]
min = [0.2, -0.3, 0.75]
max = [0.7, 0.3, 1.2]

[control.filter]
type = "none"

[heartbeat]
period_ms = 250
timeout_ms = 1000
"#;

#[test]
fn toml_and_json_descriptors_load_from_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let toml_path = dir.path().join("scene.toml");
    fs::write(&toml_path, SCENE_TOML).unwrap();

    let missing = dir.path().join("absent.toml");
    let loaded = SceneConfig::load_with_source(&[missing.as_path(), toml_path.as_path()]).unwrap();
    assert_eq!(loaded.source, toml_path);

    let config = loaded.config;
    assert_eq!(config.scene_id, "table_pick");
    assert_eq!(config.networking.listen_addr().unwrap().port(), 9001);
    assert_eq!(config.robot.ee_site, "tool0");
    assert_eq!(config.control.pause_behavior, PauseBehavior::Damp);
    assert_eq!(config.control.filter, FilterConfig::None);
    assert_eq!(config.heartbeat.timeout_ms, Duration::from_millis(1000));
    assert!(config.frames.contains_key("vp_operator_anchor"));
    assert!((config.table_floor_m() - 0.76).abs() < 1e-12);

    let json_path = dir.path().join("scene.json");
    fs::write(&json_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let reloaded = SceneConfig::from_path(&json_path).unwrap();
    assert_eq!(reloaded.scene_id, config.scene_id);
    assert_eq!(reloaded.heartbeat.period_ms, Duration::from_millis(250));
    assert_eq!(reloaded.objects[0].kind, "box");
}

#[test]
fn missing_candidates_are_listed_in_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.toml");
    let err = SceneConfig::load(&[a.as_path()]).unwrap_err();
    assert!(err.to_string().contains("a.toml"));
}

#[test]
fn mismatched_link_lengths_fail_validation() {
    let text = SCENE_TOML.replace(
        "link_lengths_m = [0.2, 0.35, 0.3, 0.15]",
        "link_lengths_m = [0.2, 0.35]",
    );
    let err = text.parse::<SceneConfig>().unwrap_err();
    assert!(err.to_string().contains("link_lengths_m"));
}

#[test]
fn world_alias_cannot_be_redefined() {
    let text = SCENE_TOML.replace("[frames.vp_operator_anchor]", "[frames.world]");
    assert!(text.parse::<SceneConfig>().is_err());
}
