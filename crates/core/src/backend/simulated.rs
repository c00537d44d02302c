//! In-process backend that plays a synthetic stream against the wall clock.
//!
//! Used by the command-line demo and by tests. Every native call is recorded
//! and a failure status can be injected per operation through the
//! [`SimulatedProbe`].

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{
    AudioFormat, BufferFill, ColorSpace, NativeBackend, NativeResult, OpenRequest, SeekMode,
    StatusCode,
};
use crate::events::{EventSink, PlayerState};

/// Pace of synthetic buffer pulls.
const PULL_PACE: Duration = Duration::from_millis(10);

/// A native call as observed by the simulated backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Init { path: String },
    Play,
    Pause,
    Stop,
    StepForward,
    StepBackward,
    Finish,
    Seek { time: f64, mode: SeekMode },
    SetRate(f32),
    SetVolume(f32),
    SetBalance(f32),
    SetAudioSyncDelay(i64),
    Dispose,
}

/// Properties of the synthetic stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedMedia {
    /// Seconds; `None` for a live stream of unknown length.
    pub duration: Option<f64>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
    pub has_image: bool,
    /// Decode speed relative to the wall clock. `1.02` runs 2% fast.
    pub skew: f64,
    pub supports_balance: bool,
    /// Output volume the decoder starts with.
    pub volume: f32,
}

impl Default for SimulatedMedia {
    fn default() -> Self {
        Self {
            duration: Some(10.0),
            fps: 30.0,
            width: 320,
            height: 240,
            has_audio: true,
            has_image: true,
            skew: 1.0,
            supports_balance: false,
            volume: 1.0,
        }
    }
}

#[derive(Debug)]
struct SimState {
    media: SimulatedMedia,
    calls: Vec<BackendCall>,
    failures: HashMap<&'static str, StatusCode>,
    events: Option<EventSink>,
    request: Option<OpenRequest>,
    playing: bool,
    /// Seconds at `anchor`.
    position: f64,
    anchor: Instant,
    pinned: Option<f64>,
    rate: f32,
    volume: f32,
    balance: f32,
    sync_delay: i64,
    finishing: bool,
    dispose_count: usize,
    frame: u8,
}

impl SimState {
    fn guard(&mut self, op: &'static str) -> NativeResult<()> {
        if self.dispose_count > 0 {
            return Err(StatusCode::DISPOSED);
        }
        match self.failures.get(op) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    fn clamp(&self, time: f64) -> f64 {
        let time = time.max(0.0);
        match self.media.duration {
            Some(duration) => time.min(duration),
            None => time,
        }
    }

    fn now(&self) -> f64 {
        if let Some(pinned) = self.pinned {
            return pinned;
        }
        if !self.playing {
            return self.position;
        }
        let elapsed = self.anchor.elapsed().as_secs_f64();
        self.clamp(self.position + elapsed * f64::from(self.rate) * self.media.skew)
    }

    /// Folds elapsed playback into `position` and restarts the anchor.
    fn settle(&mut self) {
        self.position = self.now();
        self.anchor = Instant::now();
    }

    fn post(&self, state: PlayerState) {
        if let Some(events) = &self.events {
            events.post_state(state, self.position);
        }
    }

    /// Finishes playback once the end of a bounded stream is reached.
    fn check_end(&mut self) {
        let Some(duration) = self.media.duration else {
            return;
        };
        if self.playing && self.pinned.is_none() && self.now() >= duration {
            self.position = duration;
            self.playing = false;
            self.post(PlayerState::Finished);
        }
    }
}

#[derive(Debug)]
struct SimShared {
    state: Mutex<SimState>,
    wake: Condvar,
}

/// Simulated [`NativeBackend`].
#[derive(Debug)]
pub struct SimulatedBackend {
    shared: Arc<SimShared>,
}

impl SimulatedBackend {
    pub fn new(media: SimulatedMedia) -> (Self, SimulatedProbe) {
        let state = SimState {
            volume: media.volume,
            media,
            calls: Vec::new(),
            failures: HashMap::new(),
            events: None,
            request: None,
            playing: false,
            position: 0.0,
            anchor: Instant::now(),
            pinned: None,
            rate: 1.0,
            balance: 0.0,
            sync_delay: 0,
            finishing: false,
            dispose_count: 0,
            frame: 0,
        };
        let shared = Arc::new(SimShared {
            state: Mutex::new(state),
            wake: Condvar::new(),
        });
        (
            Self {
                shared: shared.clone(),
            },
            SimulatedProbe { shared },
        )
    }

    fn command(
        &self,
        op: &'static str,
        call: BackendCall,
        apply: impl FnOnce(&mut SimState),
    ) -> NativeResult<()> {
        let mut state = self.shared.state.lock();
        state.calls.push(call);
        state.guard(op)?;
        apply(&mut state);
        trace!(op, position = state.position, "simulated command");
        self.shared.wake.notify_all();
        Ok(())
    }

    fn query<T>(&self, op: &'static str, read: impl FnOnce(&SimState) -> T) -> NativeResult<T> {
        let mut state = self.shared.state.lock();
        state.guard(op)?;
        Ok(read(&state))
    }

    fn pull(&self, op: &'static str, buffer: &mut [u8], present: bool) -> NativeResult<BufferFill> {
        let mut state = self.shared.state.lock();
        state.guard(op)?;
        if !present {
            return Ok(BufferFill::EndOfStream);
        }
        loop {
            if state.finishing || state.dispose_count > 0 {
                return Ok(BufferFill::EndOfStream);
            }
            if state.playing {
                break;
            }
            self.shared.wake.wait(&mut state);
        }

        self.shared.wake.wait_for(&mut state, PULL_PACE);
        if state.finishing || state.dispose_count > 0 {
            return Ok(BufferFill::EndOfStream);
        }
        state.check_end();
        state.frame = state.frame.wrapping_add(1);
        buffer.fill(state.frame);
        Ok(BufferFill::Data(buffer.len()))
    }
}

impl NativeBackend for SimulatedBackend {
    fn init(&mut self, request: &OpenRequest, events: EventSink) -> NativeResult<()> {
        let mut state = self.shared.state.lock();
        state.calls.push(BackendCall::Init {
            path: request.path.clone(),
        });
        state.guard("init")?;
        state.request = Some(request.clone());
        state.events = Some(events);
        state.post(PlayerState::Ready);
        Ok(())
    }

    fn dispose(&mut self) {
        let mut state = self.shared.state.lock();
        state.calls.push(BackendCall::Dispose);
        state.dispose_count += 1;
        state.playing = false;
        state.finishing = true;
        state.events = None;
        self.shared.wake.notify_all();
    }

    fn play(&self) -> NativeResult<()> {
        self.command("play", BackendCall::Play, |state| {
            state.settle();
            state.playing = true;
            state.finishing = false;
            state.post(PlayerState::Playing);
        })
    }

    fn pause(&self) -> NativeResult<()> {
        self.command("pause", BackendCall::Pause, |state| {
            state.settle();
            state.playing = false;
            state.post(PlayerState::Paused);
        })
    }

    fn stop(&self) -> NativeResult<()> {
        self.command("stop", BackendCall::Stop, |state| {
            state.settle();
            state.playing = false;
            state.post(PlayerState::Stopped);
        })
    }

    fn step_forward(&self) -> NativeResult<()> {
        self.command("step_forward", BackendCall::StepForward, |state| {
            state.settle();
            state.playing = false;
            state.position = state.clamp(state.position + 1.0 / state.media.fps);
        })
    }

    fn step_backward(&self) -> NativeResult<()> {
        self.command("step_backward", BackendCall::StepBackward, |state| {
            state.settle();
            state.playing = false;
            state.position = state.clamp(state.position - 1.0 / state.media.fps);
        })
    }

    fn finish(&self) -> NativeResult<()> {
        self.command("finish", BackendCall::Finish, |state| {
            state.finishing = true;
        })
    }

    fn seek(&self, time: f64, mode: SeekMode) -> NativeResult<()> {
        self.command("seek", BackendCall::Seek { time, mode }, |state| {
            state.position = state.clamp(time);
            state.anchor = Instant::now();
            if state.pinned.is_some() {
                state.pinned = Some(state.position);
            }
        })
    }

    fn rate(&self) -> NativeResult<f32> {
        self.query("rate", |state| state.rate)
    }

    fn set_rate(&self, rate: f32) -> NativeResult<()> {
        self.command("set_rate", BackendCall::SetRate(rate), |state| {
            state.settle();
            state.rate = rate;
        })
    }

    fn volume(&self) -> NativeResult<f32> {
        self.query("volume", |state| state.volume)
    }

    fn set_volume(&self, volume: f32) -> NativeResult<()> {
        self.command("set_volume", BackendCall::SetVolume(volume), |state| {
            state.volume = volume;
        })
    }

    fn balance(&self) -> NativeResult<f32> {
        let mut state = self.shared.state.lock();
        state.guard("balance")?;
        if !state.media.supports_balance {
            return Err(StatusCode::UNSUPPORTED);
        }
        Ok(state.balance)
    }

    fn set_balance(&self, balance: f32) -> NativeResult<()> {
        let mut state = self.shared.state.lock();
        state.calls.push(BackendCall::SetBalance(balance));
        state.guard("set_balance")?;
        if !state.media.supports_balance {
            return Err(StatusCode::UNSUPPORTED);
        }
        state.balance = balance;
        Ok(())
    }

    fn audio_sync_delay(&self) -> NativeResult<i64> {
        self.query("audio_sync_delay", |state| state.sync_delay)
    }

    fn set_audio_sync_delay(&self, delay_ms: i64) -> NativeResult<()> {
        self.command(
            "set_audio_sync_delay",
            BackendCall::SetAudioSyncDelay(delay_ms),
            |state| state.sync_delay = delay_ms,
        )
    }

    fn presentation_time(&self) -> NativeResult<f64> {
        let mut state = self.shared.state.lock();
        state.guard("presentation_time")?;
        state.check_end();
        Ok(state.now())
    }

    fn fps(&self) -> NativeResult<f64> {
        self.query("fps", |state| state.media.fps)
    }

    fn duration(&self) -> NativeResult<f64> {
        self.query("duration", |state| state.media.duration.unwrap_or(-1.0))
    }

    fn image_width(&self) -> NativeResult<u32> {
        self.query("image_width", |state| state.media.width)
    }

    fn image_height(&self) -> NativeResult<u32> {
        self.query("image_height", |state| state.media.height)
    }

    fn audio_format(&self) -> NativeResult<AudioFormat> {
        self.query("audio_format", |state| {
            state
                .request
                .as_ref()
                .map(|request| request.audio_format)
                .unwrap_or_default()
        })
    }

    fn color_space(&self) -> NativeResult<ColorSpace> {
        self.query("color_space", |state| {
            state
                .request
                .as_ref()
                .map(|request| request.color_space)
                .unwrap_or_default()
        })
    }

    fn has_audio(&self) -> NativeResult<bool> {
        self.query("has_audio", |state| state.media.has_audio)
    }

    fn has_image(&self) -> NativeResult<bool> {
        self.query("has_image", |state| state.media.has_image)
    }

    fn update_audio_data(&self, buffer: &mut [u8]) -> NativeResult<BufferFill> {
        let present = self.shared.state.lock().media.has_audio;
        self.pull("update_audio_data", buffer, present)
    }

    fn update_image_data(&self, buffer: &mut [u8]) -> NativeResult<BufferFill> {
        let present = self.shared.state.lock().media.has_image;
        self.pull("update_image_data", buffer, present)
    }
}

/// Test and demo handle onto a [`SimulatedBackend`] that the session owns.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    shared: Arc<SimShared>,
}

impl SimulatedProbe {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.shared.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.shared.state.lock().calls.clear();
    }

    /// Makes `op` fail with `status` until cleared. Operation names follow
    /// the [`NativeBackend`] method names.
    pub fn fail(&self, op: &'static str, status: StatusCode) {
        self.shared.state.lock().failures.insert(op, status);
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.shared.state.lock().failures.remove(op);
    }

    /// Freezes the reported presentation time. Seeks move the pinned value.
    pub fn pin_presentation_time(&self, time: Option<f64>) {
        self.shared.state.lock().pinned = time;
    }

    /// Emits a state change as if the native side raised it.
    pub fn emit(&self, state: PlayerState) -> bool {
        let sim = self.shared.state.lock();
        match &sim.events {
            Some(events) => events.post_state(state, sim.position),
            None => false,
        }
    }

    /// Emits a raw native error code.
    pub fn emit_error(&self, code: i32) -> bool {
        let sim = self.shared.state.lock();
        sim.events
            .as_ref()
            .is_some_and(|events| events.post_native_error(code))
    }

    pub fn dispose_count(&self) -> usize {
        self.shared.state.lock().dispose_count
    }

    pub fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    pub fn position(&self) -> f64 {
        self.shared.state.lock().now()
    }

    pub fn volume(&self) -> f32 {
        self.shared.state.lock().volume
    }
}
