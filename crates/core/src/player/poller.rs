use std::sync::{Arc, Weak};

use tracing::trace;

use super::PlaybackSession;
use crate::timeline::ClockListener;

/// Tick consumer that refreshes a session's current time and enforces its
/// stop bound. Holds the session weakly so a registered poller never keeps
/// a session alive.
#[derive(Debug, Clone)]
pub struct SessionPoller {
    session: Weak<PlaybackSession>,
}

impl SessionPoller {
    pub fn new(session: &Arc<PlaybackSession>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }

    /// Polls once. Returns `false` once the session is gone.
    pub fn poll(&self) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };
        if session.periodic_updates_enabled() {
            if let Err(err) = session.update_current_time() {
                trace!(session = %session.id(), %err, "periodic update skipped");
            }
        }
        !session.is_disposed()
    }
}

impl ClockListener for SessionPoller {
    fn clock_tick(&self, _time: i64) {
        self.poll();
    }
}
