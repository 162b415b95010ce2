//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the session orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Single-slot, latest-wins handoffs between the session loops.
//!
//! Two flavours exist:
//!
//! * the **command** mailbox is drained by its reader: each value is observed
//!   at most once and only the most recent write since the last take survives;
//! * the **state** mailbox is read by copy: the reader may see the same value
//!   any number of times until the publisher replaces it.
//!
//! Writes never block on the reader. Each write is a single slot replacement
//! under a short lock, so cancellation can never leave a half-written value.

use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome of posting into the command mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posted {
    /// The slot was empty.
    Fresh,
    /// An unread value was discarded in favour of the new one.
    Replaced,
}

#[derive(Debug)]
struct CommandSlot<T> {
    value: Mutex<Option<T>>,
}

/// Create the command mailbox, returning its writer and reader halves.
pub fn command_channel<T>() -> (CommandWriter<T>, CommandReader<T>) {
    let slot = Arc::new(CommandSlot {
        value: Mutex::new(None),
    });
    (
        CommandWriter { slot: slot.clone() },
        CommandReader { slot },
    )
}

/// Write half of the command mailbox, held by the receive loop.
#[derive(Debug)]
pub struct CommandWriter<T> {
    slot: Arc<CommandSlot<T>>,
}

impl<T> Clone for CommandWriter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> CommandWriter<T> {
    /// Store `value`, discarding any value not yet taken.
    pub fn post(&self, value: T) -> Posted {
        match self.slot.value.lock().replace(value) {
            Some(_) => Posted::Replaced,
            None => Posted::Fresh,
        }
    }

    /// Drop any pending value. Used when the session resets so a command
    /// from before the reset can never be taken after it.
    pub fn clear(&self) {
        self.slot.value.lock().take();
    }
}

/// Read half of the command mailbox, held by the control tick.
#[derive(Debug)]
pub struct CommandReader<T> {
    slot: Arc<CommandSlot<T>>,
}

impl<T> CommandReader<T> {
    /// Take the most recent value written since the last take.
    pub fn take(&self) -> Option<T> {
        self.slot.value.lock().take()
    }

    /// Drop any pending value.
    pub fn clear(&self) {
        self.slot.value.lock().take();
    }
}

#[derive(Debug)]
struct StateSlot<T> {
    value: Mutex<Option<T>>,
}

/// Create the state mailbox, returning its publisher and reader halves.
pub fn state_channel<T: Clone>() -> (StatePublisher<T>, StateReader<T>) {
    let slot = Arc::new(StateSlot {
        value: Mutex::new(None),
    });
    (
        StatePublisher { slot: slot.clone() },
        StateReader { slot },
    )
}

/// Write half of the state mailbox, held by the control tick.
#[derive(Debug)]
pub struct StatePublisher<T> {
    slot: Arc<StateSlot<T>>,
}

impl<T: Clone> StatePublisher<T> {
    /// Replace the published value.
    pub fn publish(&self, value: T) {
        *self.slot.value.lock() = Some(value);
    }
}

/// Read half of the state mailbox, held by the broadcast loop.
#[derive(Debug)]
pub struct StateReader<T> {
    slot: Arc<StateSlot<T>>,
}

impl<T> Clone for StateReader<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> StateReader<T> {
    /// Copy of the most recently published value, if any.
    pub fn latest(&self) -> Option<T> {
        self.slot.value.lock().clone()
    }
}
