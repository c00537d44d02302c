//! Player events and the queue that serialises them.
//!
//! Anything produced on a foreign execution context (native callbacks,
//! backend worker threads) is marshalled into a [`PlayerEvent`] and posted
//! through an [`EventSink`]. A single consumer thread per session drains the
//! queue in FIFO order and routes each event to the registered listeners.

mod listeners;
mod queue;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::PlayerError;

pub use listeners::{ListenerRegistry, MediaErrorListener, PlayerStateListener};
pub use queue::{EventDispatchQueue, EventHandler};

pub(crate) use listeners::route_state;
pub(crate) use queue::QueueMessage;

/// Native event identifiers delivered through the state callback.
pub mod native_codes {
    pub const UNKNOWN: i32 = 100;
    pub const READY: i32 = 101;
    pub const PLAYING: i32 = 102;
    pub const PAUSED: i32 = 103;
    pub const STOPPED: i32 = 104;
    pub const STALLED: i32 = 105;
    pub const FINISHED: i32 = 106;
    pub const ERROR: i32 = 107;
    pub const HALTED: i32 = 108;
}

/// Lifecycle state of a playback session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerState {
    #[default]
    Unknown,
    Ready,
    Playing,
    Paused,
    Stopped,
    Stalled,
    Finished,
    Halted,
}

impl PlayerState {
    /// Maps a native state code. `ERROR` and unrecognised codes yield `None`.
    pub fn from_native_code(code: i32) -> Option<Self> {
        match code {
            native_codes::UNKNOWN => Some(PlayerState::Unknown),
            native_codes::READY => Some(PlayerState::Ready),
            native_codes::PLAYING => Some(PlayerState::Playing),
            native_codes::PAUSED => Some(PlayerState::Paused),
            native_codes::STOPPED => Some(PlayerState::Stopped),
            native_codes::STALLED => Some(PlayerState::Stalled),
            native_codes::FINISHED => Some(PlayerState::Finished),
            native_codes::HALTED => Some(PlayerState::Halted),
            _ => None,
        }
    }

    pub fn native_code(self) -> i32 {
        match self {
            PlayerState::Unknown => native_codes::UNKNOWN,
            PlayerState::Ready => native_codes::READY,
            PlayerState::Playing => native_codes::PLAYING,
            PlayerState::Paused => native_codes::PAUSED,
            PlayerState::Stopped => native_codes::STOPPED,
            PlayerState::Stalled => native_codes::STALLED,
            PlayerState::Finished => native_codes::FINISHED,
            PlayerState::Halted => native_codes::HALTED,
        }
    }
}

/// Identifier of a playback session, reported as the source of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Payload handed to [`PlayerStateListener`] callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerStateEvent {
    pub source: SessionId,
    pub state: PlayerState,
    /// Presentation time in seconds reported alongside the transition.
    pub time: f64,
}

/// Event travelling through the dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged { state: PlayerState, time: f64 },
    ErrorRaised { code: i32, message: String },
}

impl PlayerEvent {
    pub fn error(err: &PlayerError) -> Self {
        PlayerEvent::ErrorRaised {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Producer side of a session's event queue.
///
/// Cheap to clone and safe to use from any thread, including threads owned
/// by the native backend. Posting never blocks. Events posted after the
/// queue terminated are discarded.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<QueueMessage>,
}

impl EventSink {
    pub(crate) fn new(tx: Sender<QueueMessage>) -> Self {
        Self { tx }
    }

    /// Enqueues an event. Returns `false` when the queue has shut down.
    pub fn post(&self, event: PlayerEvent) -> bool {
        match self.tx.send(QueueMessage::Event(event)) {
            Ok(()) => true,
            Err(err) => {
                trace!(event = ?err.into_inner(), "event posted after queue termination");
                false
            }
        }
    }

    pub fn post_state(&self, state: PlayerState, time: f64) -> bool {
        self.post(PlayerEvent::StateChanged { state, time })
    }

    pub fn post_error(&self, err: &PlayerError) -> bool {
        self.post(PlayerEvent::error(err))
    }

    /// Entry point for native state callbacks. `ERROR` is forwarded as an
    /// error event; unknown identifiers are ignored.
    pub fn post_native_state(&self, code: i32, time: f64) -> bool {
        if code == native_codes::ERROR {
            return self.post_native_error(crate::backend::StatusCode::INTERNAL.0);
        }
        match PlayerState::from_native_code(code) {
            Some(state) => self.post_state(state, time),
            None => {
                warn!(code, "ignoring unknown native state code");
                false
            }
        }
    }

    /// Entry point for native error callbacks.
    pub fn post_native_error(&self, code: i32) -> bool {
        let err = PlayerError::from_status(crate::backend::StatusCode(code));
        self.post_error(&err)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("pending", &self.tx.len())
            .finish()
    }
}
