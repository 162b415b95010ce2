//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the teleoperation workspace.
//! This crate exposes scene configuration loading, tracing setup, metrics
//! and clock helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;

pub use config::{
    ControlConfig, ControlLimits, FilterConfig, FrameConfig, HeartbeatConfig, IdlePolicy,
    LoadedSceneConfig, LoggingConfig, MetricsConfig, NetworkingConfig, ObjectConfig,
    GripperConfig, PauseBehavior, PoseConfig, RateConfig, RobotConfig, SceneConfig, TableConfig,
    WorkspaceBox, WORLD_FRAME_ALIASES,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{
    new_registry, render, JitterHistogram, JitterSummary, LoopTimingReporter, SharedRegistry,
    TeleopMetrics,
};
pub use time::{rtt_estimate_ms, unix_millis};
