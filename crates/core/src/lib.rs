//! Core library for the Media Sync engine.
//!
//! The crate drives native decoding backends through a playback lifecycle,
//! serialises their asynchronous callbacks into ordered events and keeps
//! independently decoding sessions aligned to a shared master clock. Each
//! module owns one subsystem; the command-line crate only wires them
//! together.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod player;
pub mod sync;
pub mod timeline;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{
    BufferFill, NativeBackend, OpenRequest, SeekMode, SimulatedBackend, SimulatedMedia,
    SimulatedProbe, StatusCode,
};
pub use config::{EngineConfig, SessionConfig, StopAction, SyncConfig, TickConfig};
pub use error::{PlayerError, Result};
pub use events::{
    EventDispatchQueue, EventSink, MediaErrorListener, PlayerEvent, PlayerState,
    PlayerStateEvent, PlayerStateListener, SessionId,
};
pub use output::{FrameSink, Modality, OutputWorker};
pub use player::{PlaybackSession, SessionBuilder, SessionPoller};
pub use sync::{ClockSynchronizer, SyncGroup, SyncOutcome, SyncTarget};
pub use timeline::{ClockListener, TickEngine};
