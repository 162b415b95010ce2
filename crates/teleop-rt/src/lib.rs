//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the session orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Real-time scheduling helpers and cross-task mailboxes.

pub mod mailbox;
pub mod scheduling;

pub use mailbox::{
    command_channel, state_channel, CommandReader, CommandWriter, Posted, StatePublisher,
    StateReader,
};
pub use scheduling::{period_from_hz, RateLimiter};
