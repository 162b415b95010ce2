//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Exclusive ownership of the physics engine, passed from one connection to the next.
///
/// A connection takes the engine for its whole lifetime. While it is out,
/// [`try_acquire`](EngineLease::try_acquire) returns `None`.
pub struct EngineLease<P> {
    slot: Arc<Mutex<Option<P>>>,
}

impl<P> Clone for EngineLease<P> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<P> EngineLease<P> {
    pub fn new(engine: P) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(engine))),
        }
    }

    /// Take the engine if no other connection holds it.
    pub fn try_acquire(&self) -> Option<P> {
        let engine = self.slot.lock().take();
        debug!(acquired = engine.is_some(), "engine lease requested");
        engine
    }

    /// Hand the engine back for the next connection.
    pub fn release(&self, engine: P) {
        *self.slot.lock() = Some(engine);
        debug!("engine lease released");
    }

    pub fn is_available(&self) -> bool {
        self.slot.lock().is_some()
    }
}
