use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{PlayerState, PlayerStateEvent, SessionId};

/// Receives lifecycle transitions of a session. Every method defaults to a
/// no-op so implementors only override what they need.
pub trait PlayerStateListener: Send + Sync {
    fn on_ready(&self, _event: &PlayerStateEvent) {}
    fn on_playing(&self, _event: &PlayerStateEvent) {}
    fn on_pause(&self, _event: &PlayerStateEvent) {}
    fn on_stop(&self, _event: &PlayerStateEvent) {}
    fn on_stall(&self, _event: &PlayerStateEvent) {}
    fn on_finish(&self, _event: &PlayerStateEvent) {}
    fn on_halt(&self, _event: &PlayerStateEvent) {}
}

/// Receives errors raised by a session's backend.
pub trait MediaErrorListener: Send + Sync {
    fn on_error(&self, source: SessionId, code: i32, message: &str);
}

/// Invokes the callback matching the event's state. `Unknown` is dropped.
pub(crate) fn route_state(listener: &dyn PlayerStateListener, event: &PlayerStateEvent) {
    match event.state {
        PlayerState::Ready => listener.on_ready(event),
        PlayerState::Playing => listener.on_playing(event),
        PlayerState::Paused => listener.on_pause(event),
        PlayerState::Stopped => listener.on_stop(event),
        PlayerState::Stalled => listener.on_stall(event),
        PlayerState::Finished => listener.on_finish(event),
        PlayerState::Halted => listener.on_halt(event),
        PlayerState::Unknown => {}
    }
}

/// Weakly held listener list.
///
/// The registry never keeps a listener alive. A registration whose listener
/// has been dropped is a tombstone; it is removed by the first dispatch pass
/// (or removal) that finds it.
pub struct ListenerRegistry<L: ?Sized> {
    entries: Mutex<Vec<Weak<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Weak<L>) {
        self.entries.lock().push(listener);
    }

    /// Removes every registration of `listener`. Returns whether one was found.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut entries = self.entries.lock();
        let before = entries.len();
        let mut found = false;
        entries.retain(|entry| {
            if Weak::as_ptr(entry) as *const () == target {
                found = true;
                return false;
            }
            entry.strong_count() > 0
        });
        tracing::trace!(pruned = before - entries.len(), "listener removal");
        found
    }

    /// Upgrades the live listeners and prunes tombstones in the same pass.
    ///
    /// Callbacks are invoked on the returned snapshot after the registry lock
    /// has been released, so a listener may register or remove listeners
    /// from inside a callback.
    pub fn live(&self) -> Vec<Arc<L>> {
        let mut entries = self.entries.lock();
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|entry| match entry.upgrade() {
            Some(listener) => {
                live.push(listener);
                true
            }
            None => false,
        });
        live
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of registrations, including tombstones not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
