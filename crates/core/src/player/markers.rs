use parking_lot::{Mutex, MutexGuard};

use crate::events::PlayerState;

/// What setting a start bound requires from the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartSeek {
    /// Seek to the new start right away.
    Immediate(f64),
    /// The session is stopped; the seek happens on the next `play()`.
    Deferred,
    /// Playing or finished; only the bound was recorded.
    Recorded,
}

/// Trim bounds of a session.
///
/// All mutation happens through [`MarkerManager::lock`]. The session keeps
/// the guard for the duration of any seek the mutation triggers, so a
/// concurrent `play()` never observes a half-updated bound.
#[derive(Debug)]
pub struct MarkerManager {
    inner: Mutex<Markers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Markers {
    start_time: f64,
    stop_time: f64,
    pending_start_seek: bool,
    stop_latched: bool,
}

impl MarkerManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Markers::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Markers> {
        self.inner.lock()
    }

    pub fn start_time(&self) -> f64 {
        self.inner.lock().start_time
    }

    pub fn stop_time(&self) -> f64 {
        self.inner.lock().stop_time
    }

    /// Called when the backend confirms `Stopped`: the next play resumes at
    /// the start bound.
    pub(crate) fn arm_start_seek(&self) {
        self.inner.lock().pending_start_seek = true;
    }
}

impl Default for MarkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Markers {
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn stop_time(&self) -> f64 {
        self.stop_time
    }

    pub fn has_pending_start_seek(&self) -> bool {
        self.pending_start_seek
    }

    /// Records a new start bound, clamped into `[0, stop_time]`.
    pub fn set_start_time(&mut self, time: f64, state: PlayerState) -> StartSeek {
        self.start_time = time.max(0.0).min(self.stop_time);
        match state {
            PlayerState::Stopped => {
                self.pending_start_seek = true;
                StartSeek::Deferred
            }
            PlayerState::Playing | PlayerState::Finished => StartSeek::Recorded,
            _ => StartSeek::Immediate(self.start_time),
        }
    }

    /// Records a new stop bound. Values below the start bound are raised to it.
    pub fn set_stop_time(&mut self, time: f64) {
        self.stop_time = if time.is_nan() {
            f64::INFINITY
        } else {
            time.max(self.start_time)
        };
        self.stop_latched = false;
    }

    /// Returns the start bound if a deferred seek is waiting, clearing it.
    pub fn take_pending_start(&mut self) -> Option<f64> {
        std::mem::take(&mut self.pending_start_seek).then_some(self.start_time)
    }

    /// Reports the first sample at or beyond the stop bound. Falling back
    /// below the bound (for instance after a seek) re-arms the check.
    pub fn stop_bound_crossed(&mut self, time: f64) -> bool {
        if time < self.stop_time {
            self.stop_latched = false;
            return false;
        }
        !std::mem::replace(&mut self.stop_latched, true)
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            stop_time: f64::INFINITY,
            pending_start_seek: false,
            stop_latched: false,
        }
    }
}
