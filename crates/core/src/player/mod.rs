//! Playback sessions: the lifecycle state machine above a native backend.
//!
//! Commands validate against the orchestration state and forward to the
//! backend. The backend confirms transitions asynchronously through the
//! session's [`EventDispatchQueue`]; only the queue's consumer assigns
//! [`PlayerState`]. Native failures never surface from a command: they are
//! posted as [`PlayerEvent::ErrorRaised`] and the command returns `Ok(())`.

mod audio;
mod markers;
mod poller;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    backend::{
        AudioFormat, BufferFill, ColorSpace, NativeBackend, NativeResult, OpenRequest, SeekMode,
        StatusCode,
    },
    config::{SessionConfig, StopAction},
    events::{
        route_state, EventDispatchQueue, EventHandler, ListenerRegistry, MediaErrorListener,
        PlayerEvent, PlayerState, PlayerStateEvent, PlayerStateListener, SessionId,
    },
    output::{FrameSink, Modality, OutputWorker},
    sync::SyncTarget,
    PlayerError, Result,
};

pub use audio::AudioControls;
pub use markers::{MarkerManager, Markers, StartSeek};
pub use poller::SessionPoller;

/// State shared between a session and its dispatch thread.
struct SessionCore {
    id: SessionId,
    state: RwLock<PlayerState>,
    periodic_updates: AtomicBool,
    markers: MarkerManager,
    state_listeners: ListenerRegistry<dyn PlayerStateListener>,
    error_listeners: ListenerRegistry<dyn MediaErrorListener>,
}

impl SessionCore {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: RwLock::new(PlayerState::Unknown),
            periodic_updates: AtomicBool::new(false),
            markers: MarkerManager::new(),
            state_listeners: ListenerRegistry::new(),
            error_listeners: ListenerRegistry::new(),
        }
    }

    fn apply_transition(&self, state: PlayerState) {
        *self.state.write() = state;
        match state {
            PlayerState::Playing => self.periodic_updates.store(true, Ordering::Release),
            PlayerState::Paused | PlayerState::Finished => {
                self.periodic_updates.store(false, Ordering::Release)
            }
            PlayerState::Stopped => {
                self.periodic_updates.store(false, Ordering::Release);
                self.markers.arm_start_seek();
            }
            PlayerState::Halted => {
                self.periodic_updates.store(false, Ordering::Release);
                warn!(session = %self.id, "backend halted; session is no longer usable");
            }
            PlayerState::Ready | PlayerState::Stalled | PlayerState::Unknown => {}
        }
    }
}

impl EventHandler for SessionCore {
    fn handle(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::StateChanged { state, time } => {
                if state == PlayerState::Unknown {
                    return;
                }
                self.apply_transition(state);
                debug!(session = %self.id, ?state, time, "state changed");

                let event = PlayerStateEvent {
                    source: self.id,
                    state,
                    time,
                };
                for listener in self.state_listeners.live() {
                    route_state(listener.as_ref(), &event);
                }
            }
            PlayerEvent::ErrorRaised { code, message } => {
                for listener in self.error_listeners.live() {
                    listener.on_error(self.id, code, &message);
                }
            }
        }
    }
}

/// Registers listeners before the backend is initialised, so early events
/// such as `Ready` are not missed.
pub struct SessionBuilder {
    backend: Box<dyn NativeBackend>,
    request: OpenRequest,
    config: SessionConfig,
    state_listeners: Vec<Weak<dyn PlayerStateListener>>,
    error_listeners: Vec<Weak<dyn MediaErrorListener>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state_listener<L: PlayerStateListener + 'static>(mut self, listener: &Arc<L>) -> Self {
        let weak = Arc::downgrade(listener) as Weak<dyn PlayerStateListener>;
        self.state_listeners.push(weak);
        self
    }

    pub fn error_listener<L: MediaErrorListener + 'static>(mut self, listener: &Arc<L>) -> Self {
        let weak = Arc::downgrade(listener) as Weak<dyn MediaErrorListener>;
        self.error_listeners.push(weak);
        self
    }

    /// Starts the event pipeline and initialises the backend.
    ///
    /// An initialisation failure is returned directly: no session exists
    /// yet that could carry it as an event.
    pub fn open(self) -> Result<Arc<PlaybackSession>> {
        let id = SessionId::next();
        let core = Arc::new(SessionCore::new(id));
        for listener in self.state_listeners {
            core.state_listeners.add(listener);
        }
        for listener in self.error_listeners {
            core.error_listeners.add(listener);
        }

        let queue = EventDispatchQueue::start(format!("{id}-events"), core.clone())?;
        let mut backend = self.backend;
        if let Err(status) = backend.init(&self.request, queue.sink()) {
            queue.terminate();
            let err = PlayerError::from_init_status(status);
            warn!(session = %id, path = %self.request.path, %err, "backend init failed");
            return Err(err);
        }
        let audio = match backend.volume() {
            Ok(volume) => AudioControls::with_volume(volume),
            Err(status) => {
                debug!(session = %id, %status, "backend volume unknown; assuming full volume");
                AudioControls::default()
            }
        };
        info!(session = %id, path = %self.request.path, "session opened");

        Ok(Arc::new_cyclic(|weak| PlaybackSession {
            core,
            weak: weak.clone(),
            backend: RwLock::new(Some(backend)),
            queue,
            config: self.config,
            audio: Mutex::new(audio),
            rate: Mutex::new(1.0),
            current_time: Mutex::new(0.0),
            outputs: Mutex::new(Vec::new()),
            disposed: Mutex::new(false),
        }))
    }
}

/// One playback session over an exclusively owned native backend.
pub struct PlaybackSession {
    core: Arc<SessionCore>,
    weak: Weak<PlaybackSession>,
    backend: RwLock<Option<Box<dyn NativeBackend>>>,
    queue: EventDispatchQueue,
    config: SessionConfig,
    /// Serialises volume, mute and balance writes.
    audio: Mutex<AudioControls>,
    rate: Mutex<f32>,
    current_time: Mutex<f64>,
    outputs: Mutex<Vec<OutputWorker>>,
    disposed: Mutex<bool>,
}

impl PlaybackSession {
    pub fn builder(backend: impl NativeBackend + 'static, request: OpenRequest) -> SessionBuilder {
        SessionBuilder {
            backend: Box::new(backend),
            request,
            config: SessionConfig::default(),
            state_listeners: Vec::new(),
            error_listeners: Vec::new(),
        }
    }

    /// Opens a session without pre-registered listeners.
    pub fn open(
        backend: impl NativeBackend + 'static,
        request: OpenRequest,
        config: &SessionConfig,
    ) -> Result<Arc<Self>> {
        Self::builder(backend, request).config(config.clone()).open()
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state, `None` once disposed.
    pub fn state(&self) -> Option<PlayerState> {
        (!self.is_disposed()).then(|| *self.core.state.read())
    }

    pub fn is_disposed(&self) -> bool {
        *self.disposed.lock()
    }

    /// Whether the tick consumer should refresh this session's time.
    pub fn periodic_updates_enabled(&self) -> bool {
        self.core.periodic_updates.load(Ordering::Acquire)
    }

    // ----- listeners -------------------------------------------------------

    pub fn add_state_listener<L: PlayerStateListener + 'static>(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener) as Weak<dyn PlayerStateListener>;
        self.core.state_listeners.add(weak);
    }

    pub fn remove_state_listener(&self, listener: &Arc<dyn PlayerStateListener>) -> bool {
        self.core.state_listeners.remove(listener)
    }

    pub fn add_error_listener<L: MediaErrorListener + 'static>(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener) as Weak<dyn MediaErrorListener>;
        self.core.error_listeners.add(weak);
    }

    pub fn remove_error_listener(&self, listener: &Arc<dyn MediaErrorListener>) -> bool {
        self.core.error_listeners.remove(listener)
    }

    // ----- transport -------------------------------------------------------

    /// Starts playback, first flushing a start-time seek deferred while the
    /// session was stopped.
    pub fn play(&self) -> Result<()> {
        self.ensure_commandable()?;
        let mut markers = self.core.markers.lock();
        if let Some(start) = markers.take_pending_start() {
            let start = self.clamp_to_media(start)?;
            debug!(session = %self.id(), start, "applying deferred start seek");
            self.native("seek", |b| b.seek(start, SeekMode::Accurate))?;
        }
        self.native("play", |b| b.play())?;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.ensure_commandable()?;
        self.native("pause", |b| b.pause())?;
        Ok(())
    }

    /// Stops playback and resets a non-unity rate back to 1x.
    pub fn stop(&self) -> Result<()> {
        self.ensure_commandable()?;
        if self.native("stop", |b| b.stop())?.is_none() {
            return Ok(());
        }
        if self.rate()? != 1.0 {
            self.set_rate(1.0)?;
        }
        Ok(())
    }

    pub fn toggle_pause(&self) -> Result<()> {
        match self.state() {
            Some(PlayerState::Paused) => self.play(),
            _ => self.pause(),
        }
    }

    pub fn step_forward(&self) -> Result<()> {
        self.ensure_commandable()?;
        self.native("step_forward", |b| b.step_forward())?;
        Ok(())
    }

    pub fn step_backward(&self) -> Result<()> {
        self.ensure_commandable()?;
        self.native("step_backward", |b| b.step_backward())?;
        Ok(())
    }

    /// Seeks to `time` seconds, clamped into `[0, duration]`. The seek mode
    /// follows the playback state and rate.
    pub fn seek(&self, time: f64) -> Result<()> {
        self.ensure_commandable()?;
        let target = self.clamp_to_media(time)?;
        let _markers = self.core.markers.lock();
        let playing = *self.core.state.read() == PlayerState::Playing;
        let mode = SeekMode::for_playback(playing, self.rate()?);
        debug!(session = %self.id(), target, ?mode, "seek");
        self.native("seek", |b| b.seek(target, mode))?;
        Ok(())
    }

    /// Seeks with an explicit mode, bypassing the mode policy.
    pub fn seek_with_mode(&self, time: f64, mode: SeekMode) -> Result<()> {
        self.ensure_commandable()?;
        let target = self.clamp_to_media(time)?;
        let _markers = self.core.markers.lock();
        self.native("seek", |b| b.seek(target, mode))?;
        Ok(())
    }

    // ----- rate and audio --------------------------------------------------

    /// Current playback rate; falls back to the last rate set when the
    /// backend cannot answer.
    pub fn rate(&self) -> Result<f32> {
        let cached = *self.rate.lock();
        Ok(self.native("rate", |b| b.rate())?.unwrap_or(cached))
    }

    pub fn set_rate(&self, rate: f32) -> Result<()> {
        self.ensure_commandable()?;
        if self.native("set_rate", |b| b.set_rate(rate))?.is_some() {
            *self.rate.lock() = rate;
        }
        Ok(())
    }

    pub fn is_rate_supported(&self, rate: f32) -> Result<bool> {
        Ok(self
            .native("rate_supported", |b| b.rate_supported(rate))?
            .unwrap_or(false))
    }

    /// Requested volume. While muted this is the volume restored on un-mute.
    pub fn volume(&self) -> Result<f32> {
        self.ensure_open()?;
        Ok(self.audio.lock().volume())
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.ensure_commandable()?;
        let mut audio = self.audio.lock();
        let mut next = *audio;
        if let Some(level) = next.set_volume(volume) {
            if self.native("set_volume", |b| b.set_volume(level))?.is_none() {
                return Ok(());
            }
        }
        *audio = next;
        Ok(())
    }

    pub fn is_muted(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.audio.lock().is_muted())
    }

    /// Mutes or un-mutes. Un-muting restores the latest requested volume.
    pub fn set_mute(&self, mute: bool) -> Result<()> {
        self.ensure_commandable()?;
        let mut audio = self.audio.lock();
        let mut next = *audio;
        if let Some(level) = next.set_mute(mute) {
            if self.native("set_mute", |b| b.set_volume(level))?.is_none() {
                return Ok(());
            }
        }
        *audio = next;
        Ok(())
    }

    pub fn balance(&self) -> Result<f32> {
        self.ensure_open()?;
        let cached = self.audio.lock().balance();
        Ok(self.native("balance", |b| b.balance())?.unwrap_or(cached))
    }

    /// Sets the stereo balance in `[-1, 1]`. Backends without balance
    /// control report `UnsupportedOperation` through the event queue.
    pub fn set_balance(&self, balance: f32) -> Result<()> {
        self.ensure_commandable()?;
        let mut audio = self.audio.lock();
        let mut next = *audio;
        let level = next.set_balance(balance);
        if self.native("set_balance", |b| b.set_balance(level))?.is_some() {
            *audio = next;
        }
        Ok(())
    }

    pub fn audio_sync_delay(&self) -> Result<i64> {
        Ok(self
            .native("audio_sync_delay", |b| b.audio_sync_delay())?
            .unwrap_or(0))
    }

    pub fn set_audio_sync_delay(&self, delay_ms: i64) -> Result<()> {
        self.ensure_commandable()?;
        self.native("set_audio_sync_delay", |b| b.set_audio_sync_delay(delay_ms))?;
        Ok(())
    }

    // ----- markers ---------------------------------------------------------

    pub fn start_time(&self) -> f64 {
        self.core.markers.start_time()
    }

    pub fn stop_time(&self) -> f64 {
        self.core.markers.stop_time()
    }

    /// Sets the start bound. Seeks immediately unless the session is playing,
    /// finished or stopped; a stopped session seeks on its next `play()`.
    pub fn set_start_time(&self, time: f64) -> Result<()> {
        self.ensure_commandable()?;
        let time = self.clamp_to_media(time)?;
        let mut markers = self.core.markers.lock();
        let state = *self.core.state.read();
        if let StartSeek::Immediate(start) = markers.set_start_time(time, state) {
            self.native("seek", |b| b.seek(start, SeekMode::Accurate))?;
        }
        Ok(())
    }

    /// Records the stop bound. [`PlaybackSession::update_current_time`]
    /// enforces it.
    pub fn set_stop_time(&self, time: f64) -> Result<()> {
        self.ensure_commandable()?;
        self.core.markers.lock().set_stop_time(time);
        Ok(())
    }

    // ----- timing and media properties -------------------------------------

    /// Presentation time in seconds, `None` while unknown.
    pub fn presentation_time(&self) -> Result<Option<f64>> {
        Ok(self
            .native("presentation_time", |b| b.presentation_time())?
            .filter(|time| *time >= 0.0))
    }

    /// Last time adopted by the poller or the clock synchronizer.
    pub fn current_time(&self) -> f64 {
        *self.current_time.lock()
    }

    /// Refreshes the current time from the backend and pauses (or stops)
    /// once the stop bound has been crossed.
    pub fn update_current_time(&self) -> Result<()> {
        let Some(time) = self.presentation_time()? else {
            return Ok(());
        };
        *self.current_time.lock() = time;

        let crossed = self.core.markers.lock().stop_bound_crossed(time);
        if crossed {
            debug!(session = %self.id(), time, "stop bound reached");
            match self.config.stop_action {
                StopAction::Pause => self.pause()?,
                StopAction::Stop => self.stop()?,
            }
        }
        Ok(())
    }

    /// Stream length in seconds, `f64::INFINITY` when unknown.
    pub fn duration(&self) -> Result<f64> {
        Ok(self
            .native("duration", |b| b.duration())?
            .filter(|duration| *duration >= 0.0)
            .unwrap_or(f64::INFINITY))
    }

    pub fn fps(&self) -> Result<Option<f64>> {
        self.native("fps", |b| b.fps())
    }

    pub fn image_width(&self) -> Result<Option<u32>> {
        self.native("image_width", |b| b.image_width())
    }

    pub fn image_height(&self) -> Result<Option<u32>> {
        self.native("image_height", |b| b.image_height())
    }

    pub fn audio_format(&self) -> Result<Option<AudioFormat>> {
        self.native("audio_format", |b| b.audio_format())
    }

    pub fn color_space(&self) -> Result<Option<ColorSpace>> {
        self.native("color_space", |b| b.color_space())
    }

    pub fn has_audio(&self) -> Result<bool> {
        Ok(self.native("has_audio", |b| b.has_audio())?.unwrap_or(false))
    }

    pub fn has_image(&self) -> Result<bool> {
        Ok(self.native("has_image", |b| b.has_image())?.unwrap_or(false))
    }

    // ----- output ----------------------------------------------------------

    /// Pulls decoded audio into `buffer`. A backend failure is reported as an
    /// event and ends the stream for the caller.
    pub fn update_audio_data(&self, buffer: &mut [u8]) -> Result<BufferFill> {
        Ok(self
            .native("update_audio_data", |b| b.update_audio_data(buffer))?
            .unwrap_or(BufferFill::EndOfStream))
    }

    /// Pulls a decoded image into `buffer`.
    pub fn update_image_data(&self, buffer: &mut [u8]) -> Result<BufferFill> {
        Ok(self
            .native("update_image_data", |b| b.update_image_data(buffer))?
            .unwrap_or(BufferFill::EndOfStream))
    }

    /// Spawns a worker that feeds decoded buffers of `modality` into `sink`
    /// until the stream ends or the session is disposed.
    pub fn attach_output(&self, modality: Modality, sink: Box<dyn FrameSink>) -> Result<()> {
        self.ensure_commandable()?;
        let buffer_len = match modality {
            Modality::Audio => self.config.audio_buffer_size,
            Modality::Image => {
                let width = self.image_width()?.unwrap_or(0) as usize;
                let height = self.image_height()?.unwrap_or(0) as usize;
                let color_space = self.color_space()?.unwrap_or(self.config.color_space);
                width * height * color_space.bytes_per_pixel()
            }
        };
        if buffer_len == 0 {
            return Err(PlayerError::msg(format!(
                "{modality:?} output has an empty frame buffer"
            )));
        }

        let worker = OutputWorker::spawn(
            format!("{}-{}", self.id(), modality.label()),
            self.weak.clone(),
            modality,
            buffer_len,
            sink,
        )?;
        self.outputs.lock().push(worker);
        Ok(())
    }

    // ----- teardown --------------------------------------------------------

    /// Releases the session. Only the first call has an effect.
    ///
    /// The dispatch consumer is unblocked and stopped, blocked pulls are
    /// released through `finish()`, output workers are joined, then the
    /// native handle is disposed. Safe to call from a listener or output worker of this
    /// session.
    pub fn dispose(&self) {
        {
            let mut disposed = self.disposed.lock();
            if *disposed {
                return;
            }
            *disposed = true;
        }
        info!(session = %self.id(), "disposing session");

        self.core.periodic_updates.store(false, Ordering::Release);
        self.queue.terminate();

        // Release every pull blocked inside the backend, including callers of
        // `update_audio_data` outside the output workers. They hold the
        // backend read lock that disposal has to acquire for writing.
        let workers = std::mem::take(&mut *self.outputs.lock());
        for worker in &workers {
            worker.request_stop();
        }
        if let Some(backend) = self.backend.read().as_deref() {
            if let Err(status) = backend.finish() {
                debug!(session = %self.id(), %status, "finish before dispose failed");
            }
        }
        for worker in workers {
            worker.join();
        }

        if let Some(mut backend) = self.backend.write().take() {
            backend.dispose();
        }
        self.core.state_listeners.clear();
        self.core.error_listeners.clear();
    }

    // ----- helpers ---------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            Err(PlayerError::AlreadyDisposed)
        } else {
            Ok(())
        }
    }

    fn ensure_commandable(&self) -> Result<()> {
        self.ensure_open()?;
        if *self.core.state.read() == PlayerState::Halted {
            return Err(PlayerError::SessionHalted);
        }
        Ok(())
    }

    /// Runs a native primitive. `Ok(None)` means the backend failed and the
    /// failure has been posted to the event queue.
    fn native<T>(
        &self,
        op: &'static str,
        call: impl FnOnce(&dyn NativeBackend) -> NativeResult<T>,
    ) -> Result<Option<T>> {
        self.ensure_open()?;
        let backend = self.backend.read();
        let backend = backend.as_deref().ok_or(PlayerError::AlreadyDisposed)?;
        match call(backend) {
            Ok(value) => Ok(Some(value)),
            Err(status) => {
                self.report(op, status);
                Ok(None)
            }
        }
    }

    fn report(&self, op: &'static str, status: StatusCode) {
        if status == StatusCode::REPORTED {
            debug!(session = %self.id(), op, "backend call failed; raised by the backend");
            return;
        }
        let err = match status {
            StatusCode::UNSUPPORTED => PlayerError::UnsupportedOperation(op),
            other => PlayerError::from_status(other),
        };
        warn!(session = %self.id(), op, %status, %err, "backend call failed");
        self.queue.post_event(PlayerEvent::error(&err));
    }

    fn clamp_to_media(&self, time: f64) -> Result<f64> {
        if time.is_nan() || time < 0.0 {
            return Ok(0.0);
        }
        let duration = self.duration()?;
        if duration.is_finite() && time > duration {
            Ok(duration)
        } else {
            Ok(time)
        }
    }
}

impl SyncTarget for PlaybackSession {
    fn presentation_time(&self) -> Option<f64> {
        PlaybackSession::presentation_time(self).ok().flatten()
    }

    fn corrective_seek(&self, time: f64) {
        if let Err(err) = self.seek(time) {
            debug!(session = %self.id(), %err, "corrective seek rejected");
        }
    }

    fn adopt_time(&self, time: f64) {
        *self.current_time.lock() = time;
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.core.id)
            .field("state", &*self.core.state.read())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests;
