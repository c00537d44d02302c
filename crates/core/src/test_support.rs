use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    backend::{OpenRequest, SimulatedBackend, SimulatedMedia, SimulatedProbe},
    config::SessionConfig,
    events::{MediaErrorListener, PlayerState, PlayerStateEvent, PlayerStateListener, SessionId},
    player::PlaybackSession,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observed {
    State(PlayerState, f64),
    Error { code: i32, message: String },
}

/// Listener that forwards every callback into a channel.
pub(crate) struct Recorder {
    tx: Sender<Observed>,
}

impl Recorder {
    pub(crate) fn new() -> (Arc<Self>, Receiver<Observed>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    fn state(&self, event: &PlayerStateEvent) {
        let _ = self.tx.send(Observed::State(event.state, event.time));
    }
}

impl PlayerStateListener for Recorder {
    fn on_ready(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
    fn on_playing(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
    fn on_pause(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
    fn on_stop(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
    fn on_stall(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
    fn on_finish(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
    fn on_halt(&self, event: &PlayerStateEvent) {
        self.state(event);
    }
}

impl MediaErrorListener for Recorder {
    fn on_error(&self, _source: SessionId, code: i32, message: &str) {
        let _ = self.tx.send(Observed::Error {
            code,
            message: message.to_owned(),
        });
    }
}

/// Blocks until `state` is observed, skipping anything else.
pub(crate) fn wait_for_state(rx: &Receiver<Observed>, state: PlayerState) -> f64 {
    loop {
        match rx.recv_timeout(WAIT) {
            Ok(Observed::State(seen, time)) if seen == state => return time,
            Ok(_) => continue,
            Err(err) => panic!("no {state:?} event: {err}"),
        }
    }
}

/// Blocks until an error callback is observed.
pub(crate) fn wait_for_error(rx: &Receiver<Observed>) -> (i32, String) {
    loop {
        match rx.recv_timeout(WAIT) {
            Ok(Observed::Error { code, message }) => return (code, message),
            Ok(_) => continue,
            Err(err) => panic!("no error event: {err}"),
        }
    }
}

pub(crate) struct Harness {
    pub session: Arc<PlaybackSession>,
    pub probe: SimulatedProbe,
    pub events: Receiver<Observed>,
    // Listeners are held weakly by the session.
    _recorder: Arc<Recorder>,
}

/// Opens a simulated session and waits until it reports `Ready`.
pub(crate) fn open(media: SimulatedMedia, config: SessionConfig) -> Harness {
    let (backend, probe) = SimulatedBackend::new(media);
    let (recorder, events) = Recorder::new();
    let session = PlaybackSession::builder(backend, OpenRequest::new("sim://clip", &config))
        .config(config)
        .state_listener(&recorder)
        .error_listener(&recorder)
        .open()
        .expect("simulated session opens");
    wait_for_state(&events, PlayerState::Ready);
    Harness {
        session,
        probe,
        events,
        _recorder: recorder,
    }
}
