//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_schema_version() -> String {
    "1.0.0-revA".to_owned()
}

fn default_ws_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_ws_port() -> u16 {
    8765
}

fn default_ws_path() -> String {
    "/ws".to_owned()
}

fn default_ee_site() -> String {
    "ee_site".to_owned()
}

fn default_gripper_actuator() -> String {
    "gripper".to_owned()
}

fn default_base_pos() -> [f64; 3] {
    [0.0, 0.0, 1.0]
}

fn default_table_height() -> f64 {
    1.0
}

fn default_identity_quat() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn default_workspace_min() -> [f64; 3] {
    [0.2, -0.4, 1.0]
}

fn default_workspace_max() -> [f64; 3] {
    [0.8, 0.4, 1.5]
}

fn default_max_ee_speed() -> f64 {
    0.5
}

fn default_max_joint_speed() -> f64 {
    1.5
}

fn default_table_clearance() -> f64 {
    0.02
}

fn default_position_gain() -> f64 {
    1.0
}

fn default_pause_damping() -> f64 {
    0.5
}

fn default_min_cutoff() -> f64 {
    1.0
}

fn default_beta() -> f64 {
    0.05
}

fn default_d_cutoff() -> f64 {
    1.0
}

fn default_lowpass_alpha() -> f64 {
    0.5
}

fn default_heartbeat_period() -> Duration {
    Duration::from_millis(500)
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_rate_hz() -> f64 {
    60.0
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_owned()
}

/// Frame names that always resolve to the simulation world frame.
pub const WORLD_FRAME_ALIASES: [&str; 3] = ["", "world", "sim"];

/// Scene descriptor loaded once per server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub scene_id: String,
    #[serde(default)]
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub frames: IndexMap<String, FrameConfig>,
    pub robot: RobotConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub rates: RateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`SceneConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedSceneConfig {
    pub config: SceneConfig,
    pub source: PathBuf,
}

impl SceneConfig {
    pub const ENV_CONFIG_PATH: &str = "TELEOP_SCENE_CONFIG";

    /// Load configuration from disk, respecting the `TELEOP_SCENE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedSceneConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedSceneConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedSceneConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no scene configuration found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a descriptor file. `.json` files are read as JSON, anything else as TOML.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading scene configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read scene config {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str::<SceneConfig>(&contents)
                .with_context(|| format!("failed to parse scene config {}", path.display()))?
        } else {
            toml::from_str::<SceneConfig>(&contents)
                .with_context(|| format!("failed to parse scene config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Number of actuated arm joints.
    pub fn joint_count(&self) -> usize {
        self.robot.home_q.len()
    }

    /// Lowest z a target may reach: table top plus the configured clearance.
    pub fn table_floor_m(&self) -> f64 {
        self.table.top_height_m + self.control.limits.table_clearance_m
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.scene_id.trim().is_empty() {
            bail!("scene_id must not be empty");
        }
        self.networking.validate()?;
        self.robot.validate()?;
        self.control.validate()?;
        self.heartbeat.validate()?;
        self.rates.validate()?;
        if !self.table.top_height_m.is_finite() {
            bail!("table.top_height_m must be finite");
        }

        let mut names = HashSet::new();
        for object in &self.objects {
            if !names.insert(object.name.as_str()) {
                bail!("object '{}' is declared more than once", object.name);
            }
            object.pose.validate(&object.name)?;
        }
        for (name, frame) in &self.frames {
            if WORLD_FRAME_ALIASES.contains(&name.as_str()) {
                bail!("frame '{}' shadows the world frame", name);
            }
            frame.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for SceneConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: SceneConfig =
            toml::from_str(content).with_context(|| "failed to parse scene configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkingConfig {
    #[serde(default = "default_ws_host")]
    pub ws_host: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            ws_host: default_ws_host(),
            ws_port: default_ws_port(),
            ws_path: default_ws_path(),
        }
    }
}

impl NetworkingConfig {
    /// Socket address the WebSocket listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = if self.ws_host.eq_ignore_ascii_case("localhost") {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.ws_host
                .parse()
                .with_context(|| format!("invalid networking.ws_host '{}'", self.ws_host))?
        };
        Ok(SocketAddr::new(ip, self.ws_port))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ws_path.starts_with('/') {
            bail!("networking.ws_path must start with '/'");
        }
        self.listen_addr().map(|_| ())
    }
}

/// Homogeneous transform from a named operator frame into the simulation world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Row-major 4x4 matrix.
    #[serde(alias = "t_sim_from_vp_anchor")]
    pub t_sim_from_frame: [f64; 16],
}

impl FrameConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.t_sim_from_frame.iter().any(|v| !v.is_finite()) {
            bail!("frame '{}' contains non-finite entries", name);
        }
        if self.t_sim_from_frame[12..] != [0.0, 0.0, 0.0, 1.0] {
            bail!("frame '{}' must be affine (last row 0 0 0 1)", name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GripperConfig {
    #[serde(default = "default_gripper_actuator")]
    pub actuator_name: String,
}

impl Default for GripperConfig {
    fn default() -> Self {
        Self {
            actuator_name: default_gripper_actuator(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Joint positions restored on RESET, one per actuated joint.
    pub home_q: Vec<f64>,
    /// Segment lengths for the reference kinematic arm. Empty selects defaults.
    #[serde(default)]
    pub link_lengths_m: Vec<f64>,
    #[serde(default = "default_base_pos")]
    pub base_pos_m: [f64; 3],
    #[serde(default = "default_ee_site")]
    pub ee_site: String,
    #[serde(default)]
    pub gripper: GripperConfig,
}

impl RobotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.home_q.is_empty() {
            bail!("robot.home_q must list at least one joint");
        }
        if self.home_q.iter().any(|q| !q.is_finite()) {
            bail!("robot.home_q must be finite");
        }
        if !self.link_lengths_m.is_empty() {
            if self.link_lengths_m.len() != self.home_q.len() {
                bail!(
                    "robot.link_lengths_m has {} entries but home_q has {}",
                    self.link_lengths_m.len(),
                    self.home_q.len()
                );
            }
            if self.link_lengths_m.iter().any(|l| !(l.is_finite() && *l > 0.0)) {
                bail!("robot.link_lengths_m must be positive");
            }
        }
        if self.ee_site.trim().is_empty() {
            bail!("robot.ee_site must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_table_height")]
    pub top_height_m: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            top_height_m: default_table_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoseConfig {
    pub pos_m: [f64; 3],
    #[serde(default = "default_identity_quat")]
    pub quat_xyzw: [f64; 4],
}

impl PoseConfig {
    fn validate(&self, owner: &str) -> Result<()> {
        if self.pos_m.iter().chain(self.quat_xyzw.iter()).any(|v| !v.is_finite()) {
            bail!("pose of '{}' contains non-finite values", owner);
        }
        let norm = self.quat_xyzw.iter().map(|v| v * v).sum::<f64>().sqrt();
        if (norm - 1.0).abs() > 1e-3 {
            bail!("quaternion of '{}' is not normalised (|q| = {:.4})", owner, norm);
        }
        Ok(())
    }
}

/// Object tracked in every state frame and restored on RESET.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub size_m: Vec<f64>,
    pub pose: PoseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceBox {
    #[serde(default = "default_workspace_min")]
    pub min: [f64; 3],
    #[serde(default = "default_workspace_max")]
    pub max: [f64; 3],
}

impl Default for WorkspaceBox {
    fn default() -> Self {
        Self {
            min: default_workspace_min(),
            max: default_workspace_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlLimits {
    #[serde(default)]
    pub workspace_aabb_m: WorkspaceBox,
    #[serde(default = "default_max_ee_speed")]
    pub max_ee_speed_mps: f64,
    #[serde(default = "default_max_joint_speed")]
    pub max_joint_speed_rad_s: f64,
    #[serde(default = "default_table_clearance")]
    pub table_clearance_m: f64,
}

impl Default for ControlLimits {
    fn default() -> Self {
        Self {
            workspace_aabb_m: WorkspaceBox::default(),
            max_ee_speed_mps: default_max_ee_speed(),
            max_joint_speed_rad_s: default_max_joint_speed(),
            table_clearance_m: default_table_clearance(),
        }
    }
}

impl ControlLimits {
    pub fn validate(&self) -> Result<()> {
        let ws = &self.workspace_aabb_m;
        for axis in 0..3 {
            if !(ws.min[axis].is_finite() && ws.max[axis].is_finite()) {
                bail!("workspace_aabb_m must be finite");
            }
            if ws.min[axis] > ws.max[axis] {
                bail!("workspace_aabb_m.min exceeds max on axis {}", axis);
            }
        }
        if !(self.max_ee_speed_mps.is_finite() && self.max_ee_speed_mps > 0.0) {
            bail!("max_ee_speed_mps must be positive");
        }
        if !(self.max_joint_speed_rad_s.is_finite() && self.max_joint_speed_rad_s > 0.0) {
            bail!("max_joint_speed_rad_s must be positive");
        }
        if !(self.table_clearance_m.is_finite() && self.table_clearance_m >= 0.0) {
            bail!("table_clearance_m must be zero or positive");
        }
        Ok(())
    }
}

/// Temporal smoothing applied to operator targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Adaptive low-pass whose cutoff grows with target speed.
    OneEuro {
        #[serde(default = "default_min_cutoff")]
        min_cutoff: f64,
        #[serde(default = "default_beta")]
        beta: f64,
        #[serde(default = "default_d_cutoff")]
        d_cutoff: f64,
    },
    /// Fixed-coefficient exponential smoothing.
    Lowpass {
        #[serde(default = "default_lowpass_alpha")]
        alpha: f64,
    },
    /// Targets pass through untouched.
    None,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig::OneEuro {
            min_cutoff: default_min_cutoff(),
            beta: default_beta(),
            d_cutoff: default_d_cutoff(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            FilterConfig::OneEuro {
                min_cutoff,
                beta,
                d_cutoff,
            } => {
                if !(min_cutoff.is_finite() && *min_cutoff > 0.0) {
                    bail!("one_euro.min_cutoff must be positive");
                }
                if !(beta.is_finite() && *beta >= 0.0) {
                    bail!("one_euro.beta must be zero or positive");
                }
                if !(d_cutoff.is_finite() && *d_cutoff > 0.0) {
                    bail!("one_euro.d_cutoff must be positive");
                }
            }
            FilterConfig::Lowpass { alpha } => {
                if !(alpha.is_finite() && *alpha > 0.0 && *alpha <= 1.0) {
                    bail!("lowpass.alpha must lie in (0, 1]");
                }
            }
            FilterConfig::None => {}
        }
        Ok(())
    }
}

/// Command issued while the session is paused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PauseBehavior {
    /// Zero joint velocity.
    #[default]
    Hold,
    /// Decay the current joint velocity by `pause_damping` each tick.
    Damp,
}

/// What a RUNNING tick does when no new control frame arrived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Keep tracking the last safe target through the speed limits and IK.
    /// The arm settles on the target and stays there.
    #[default]
    TrackLastTarget,
    /// Write zero joint velocity until the next control frame arrives.
    HoldPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub limits: ControlLimits,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub pause_behavior: PauseBehavior,
    #[serde(default = "default_pause_damping")]
    pub pause_damping: f64,
    /// Task-space velocity per metre of position error, in 1/s.
    #[serde(default = "default_position_gain")]
    pub position_gain: f64,
    #[serde(default)]
    pub idle_policy: IdlePolicy,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            limits: ControlLimits::default(),
            filter: FilterConfig::default(),
            pause_behavior: PauseBehavior::default(),
            pause_damping: default_pause_damping(),
            position_gain: default_position_gain(),
            idle_policy: IdlePolicy::default(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.filter.validate()?;
        if !(self.position_gain.is_finite() && self.position_gain > 0.0) {
            bail!("control.position_gain must be positive");
        }
        if !(0.0..=1.0).contains(&self.pause_damping) {
            bail!("control.pause_damping must lie in [0, 1]");
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub period_ms: Duration,
    #[serde(default = "default_heartbeat_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout_ms: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period_ms: default_heartbeat_period(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms.is_zero() {
            bail!("heartbeat.timeout_ms must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_rate_hz")]
    pub state_hz: f64,
    #[serde(default = "default_rate_hz")]
    pub control_hz: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            state_hz: default_rate_hz(),
            control_hz: default_rate_hz(),
        }
    }
}

impl RateConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, hz) in [("state_hz", self.state_hz), ("control_hz", self.control_hz)] {
            if !(hz.is_finite() && hz > 0.0 && hz <= 10_000.0) {
                bail!("rates.{} must lie in (0, 10000]", name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            path: default_metrics_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
scene_id = "default_scene"

[robot]
home_q = [0.0, 0.4, -0.8, 0.4]
"#;

    #[test]
    fn minimal_descriptor_fills_defaults() {
        let config: SceneConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.schema_version, "1.0.0-revA");
        assert_eq!(config.networking.ws_port, 8765);
        assert_eq!(config.networking.ws_path, "/ws");
        assert_eq!(config.rates.state_hz, 60.0);
        assert_eq!(config.control.pause_behavior, PauseBehavior::Hold);
        assert_eq!(config.control.idle_policy, IdlePolicy::TrackLastTarget);
        assert!(matches!(config.control.filter, FilterConfig::OneEuro { .. }));
        assert_eq!(config.heartbeat.timeout_ms, Duration::from_secs(2));
        assert!((config.table_floor_m() - 1.02).abs() < 1e-12);
    }

    #[test]
    fn empty_table_section_matches_missing_one() {
        let missing: SceneConfig = MINIMAL.parse().unwrap();
        let empty: SceneConfig = format!("{MINIMAL}\n[table]\n").parse().unwrap();
        assert_eq!(empty.table.top_height_m, missing.table.top_height_m);
        assert_eq!(empty.table_floor_m(), missing.table_floor_m());
    }

    #[test]
    fn filter_selection_is_adjacently_tagged() {
        let text = format!(
            "{MINIMAL}\n[control.filter]\ntype = \"lowpass\"\nparams = {{ alpha = 0.3 }}\n"
        );
        let config: SceneConfig = text.parse().unwrap();
        assert_eq!(config.control.filter, FilterConfig::Lowpass { alpha: 0.3 });
    }

    #[test]
    fn inverted_workspace_is_rejected() {
        let text = format!(
            "{MINIMAL}\n[control.limits.workspace_aabb_m]\nmin = [0.5, 0.0, 1.0]\nmax = [0.4, 0.1, 1.2]\n"
        );
        let err = text.parse::<SceneConfig>().unwrap_err();
        assert!(err.to_string().contains("workspace_aabb_m"));
    }

    #[test]
    fn non_unit_object_quaternion_is_rejected() {
        let text = format!(
            "{MINIMAL}\n[[objects]]\nname = \"cube\"\ntype = \"box\"\npose = {{ pos_m = [0.5, 0.0, 1.03], quat_xyzw = [0.0, 0.0, 0.0, 2.0] }}\n"
        );
        assert!(text.parse::<SceneConfig>().is_err());
    }

    #[test]
    fn localhost_resolves_to_loopback() {
        let networking = NetworkingConfig {
            ws_host: "localhost".into(),
            ..NetworkingConfig::default()
        };
        assert_eq!(
            networking.listen_addr().unwrap(),
            "127.0.0.1:8765".parse().unwrap()
        );
    }
}
