//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Operator-facing network surface.
//!
//! One axum router serves the WebSocket endpoint and, when enabled, the
//! Prometheus `/metrics` route. Each accepted socket is bridged onto a
//! [`teleop_core::ConnectionIo`] and driven by its own session orchestrator.

pub mod lease;
pub mod server;

pub use lease::EngineLease;
pub use server::{TeleopServerBuilder, TeleopServerHandle, BUSY_REASON};
