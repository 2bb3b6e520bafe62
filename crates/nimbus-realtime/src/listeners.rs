//! Connection-state and error listeners.
//!
//! Listeners are kept in registration order and survive `disconnect()`.
//! They are cloned out of the list before being called, so a listener may
//! register or remove listeners itself.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::error::RealtimeError;
use crate::state::ConnectionStatus;

/// Type alias for connection-state listeners.
pub type StateListener = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Type alias for error listeners.
pub type ErrorListener = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    state: Vec<(ListenerId, StateListener)>,
    error: Vec<(ListenerId, ErrorListener)>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("state", &self.state.len())
            .field("error", &self.error.len())
            .finish()
    }
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    pub(crate) fn add_state(&mut self, listener: StateListener) -> ListenerId {
        let id = self.next_id();
        self.state.push((id, listener));
        id
    }

    pub(crate) fn add_error(&mut self, listener: ErrorListener) -> ListenerId {
        let id = self.next_id();
        self.error.push((id, listener));
        id
    }

    /// Remove a listener of either kind.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.state.len() + self.error.len();
        self.state.retain(|(existing, _)| *existing != id);
        self.error.retain(|(existing, _)| *existing != id);
        before != self.state.len() + self.error.len()
    }

    pub(crate) fn state_listeners(&self) -> Vec<StateListener> {
        self.state.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub(crate) fn error_listeners(&self) -> Vec<ErrorListener> {
        self.error.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Call every listener, logging any that panics.
pub(crate) fn notify<T: ?Sized>(listeners: &[Arc<dyn Fn(&T) + Send + Sync>], value: &T, kind: &str) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            error!(listener = %kind, "Listener panicked");
        }
    }
}
