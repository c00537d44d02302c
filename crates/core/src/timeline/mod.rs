//! Free-running millisecond clock shared by everything that needs a common
//! notion of elapsed time.
//!
//! The engine never talks to a backend. Consumers such as the session poller
//! and the sync group subscribe as [`ClockListener`]s.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace};

use crate::{config::TickConfig, Result};

/// Receives clock notifications. Every time is in whole milliseconds.
pub trait ClockListener: Send + Sync {
    fn clock_tick(&self, _time: i64) {}
    fn clock_start(&self, _time: i64) {}
    fn clock_stop(&self, _time: i64) {}
    fn clock_rate(&self, _rate: f32) {}
    fn clock_step(&self, _time: i64) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Notification {
    Tick(i64),
    Start(i64),
    Stop(i64),
    Rate(f32),
    Step(i64),
}

#[derive(Debug)]
struct ClockState {
    /// Milliseconds, kept fractional so slow rates still accumulate.
    time: f64,
    anchor: Instant,
    stopped: bool,
    /// Stopped flag observed by the previous tick.
    was_stopped: bool,
    rate: f32,
    shutdown: bool,
}

struct ClockShared {
    state: Mutex<ClockState>,
    wake: Condvar,
    listeners: RwLock<Vec<Arc<dyn ClockListener>>>,
}

impl ClockShared {
    fn tick(&self) {
        let notes = {
            let mut state = self.state.lock();
            let mut notes = Vec::with_capacity(2);
            if state.was_stopped != state.stopped {
                let now = state.time as i64;
                notes.push(if state.stopped {
                    Notification::Stop(now)
                } else {
                    Notification::Start(now)
                });
                state.was_stopped = state.stopped;
            }
            if !state.stopped {
                let now = Instant::now();
                let elapsed = now.duration_since(state.anchor).as_secs_f64() * 1_000.0;
                state.time = (state.time + f64::from(state.rate) * elapsed).max(0.0);
                state.anchor = now;
                notes.push(Notification::Tick(state.time as i64));
            }
            notes
        };
        self.notify(&notes);
    }

    fn notify(&self, notes: &[Notification]) {
        if notes.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for note in notes {
            trace!(?note, "clock notification");
            for listener in &listeners {
                match *note {
                    Notification::Tick(time) => listener.clock_tick(time),
                    Notification::Start(time) => listener.clock_start(time),
                    Notification::Stop(time) => listener.clock_stop(time),
                    Notification::Rate(rate) => listener.clock_rate(rate),
                    Notification::Step(time) => listener.clock_step(time),
                }
            }
        }
    }
}

/// Periodic clock with `Stopped` and `Running` states.
///
/// Start and stop edges are reported by the first tick after the change,
/// not by the call itself. Rate changes and steps are reported immediately.
pub struct TickEngine {
    shared: Arc<ClockShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TickEngine {
    /// Spawns the tick thread with the configured period.
    pub fn new(config: &TickConfig) -> Result<Self> {
        Self::starting_at(config, 0)
    }

    pub fn starting_at(config: &TickConfig, initial_ms: i64) -> Result<Self> {
        let engine = Self::manual(initial_ms);
        let shared = engine.shared.clone();
        let period = config.period();
        let worker = thread::Builder::new()
            .name("tick-engine".into())
            .spawn(move || run(shared, period))?;
        *engine.worker.lock() = Some(worker);
        debug!(period_ms = period.as_millis() as u64, "tick engine started");
        Ok(engine)
    }

    /// Creates an engine without a tick thread; the owner calls
    /// [`TickEngine::tick`] itself.
    pub fn manual(initial_ms: i64) -> Self {
        let state = ClockState {
            time: initial_ms.max(0) as f64,
            anchor: Instant::now(),
            stopped: true,
            was_stopped: true,
            rate: 1.0,
            shutdown: false,
        };
        Self {
            shared: Arc::new(ClockShared {
                state: Mutex::new(state),
                wake: Condvar::new(),
                listeners: RwLock::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Advances the clock by the scaled wall time since the previous tick
    /// and emits pending edge notifications.
    pub fn tick(&self) {
        self.shared.tick();
    }

    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            state.anchor = Instant::now();
            state.stopped = false;
        }
    }

    /// Stops the clock and drops the rate to zero. The stop edge is reported
    /// by the next tick.
    pub fn stop(&self) {
        let stopped_now = {
            let mut state = self.shared.state.lock();
            !std::mem::replace(&mut state.stopped, true)
        };
        if stopped_now {
            self.set_rate(0.0);
        }
    }

    pub fn set_rate(&self, rate: f32) {
        self.shared.state.lock().rate = rate;
        self.shared.notify(&[Notification::Rate(rate)]);
    }

    /// Jumps to `ms` when stopped. A running clock is stopped instead and the
    /// requested time is discarded.
    pub fn set_time(&self, ms: i64) -> bool {
        self.jump(|_| ms, true)
    }

    /// Like [`TickEngine::set_time`] without the step notification.
    pub fn set_time_silently(&self, ms: i64) -> bool {
        self.jump(|_| ms, false)
    }

    /// Moves a stopped clock by `delta_ms`.
    pub fn step_time(&self, delta_ms: i64) -> bool {
        self.jump(|time| time + delta_ms, true)
    }

    fn jump(&self, target: impl FnOnce(i64) -> i64, notify: bool) -> bool {
        let step = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                state.time = target(state.time as i64).max(0) as f64;
                Some(state.time as i64)
            } else {
                None
            }
        };
        match step {
            Some(time) => {
                if notify {
                    self.shared.notify(&[Notification::Step(time)]);
                }
                true
            }
            None => {
                debug!("time change refused while running; stopping clock");
                self.stop();
                false
            }
        }
    }

    pub fn time(&self) -> i64 {
        self.shared.state.lock().time as i64
    }

    pub fn rate(&self) -> f32 {
        self.shared.state.lock().rate
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    pub fn register_listener(&self, listener: Arc<dyn ClockListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClockListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| Arc::as_ptr(entry) as *const () != target);
        listeners.len() != before
    }
}

impl Drop for TickEngine {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!("tick thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for TickEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TickEngine")
            .field("time", &state.time)
            .field("rate", &state.rate)
            .field("stopped", &state.stopped)
            .finish()
    }
}

fn run(shared: Arc<ClockShared>, period: std::time::Duration) {
    let mut deadline = Instant::now();
    loop {
        {
            let mut state = shared.state.lock();
            while !state.shutdown && Instant::now() < deadline {
                shared.wake.wait_until(&mut state, deadline);
            }
            if state.shutdown {
                break;
            }
        }
        shared.tick();

        deadline += period;
        let now = Instant::now();
        if deadline < now {
            // Fell behind; skip the missed ticks instead of bursting.
            deadline = now + period;
        }
    }
    debug!("tick thread exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::{Receiver, Sender};

    use super::*;

    struct Recorder(Sender<Notification>);

    impl ClockListener for Recorder {
        fn clock_tick(&self, time: i64) {
            let _ = self.0.send(Notification::Tick(time));
        }
        fn clock_start(&self, time: i64) {
            let _ = self.0.send(Notification::Start(time));
        }
        fn clock_stop(&self, time: i64) {
            let _ = self.0.send(Notification::Stop(time));
        }
        fn clock_rate(&self, rate: f32) {
            let _ = self.0.send(Notification::Rate(rate));
        }
        fn clock_step(&self, time: i64) {
            let _ = self.0.send(Notification::Step(time));
        }
    }

    fn recorded(engine: &TickEngine) -> Receiver<Notification> {
        let (tx, rx) = crossbeam_channel::unbounded();
        engine.register_listener(Arc::new(Recorder(tx)));
        rx
    }

    fn drain(rx: &Receiver<Notification>) -> Vec<Notification> {
        rx.try_iter().collect()
    }

    #[test]
    fn edges_are_reported_on_the_next_tick() {
        let engine = TickEngine::manual(0);
        let rx = recorded(&engine);

        engine.tick();
        assert!(drain(&rx).is_empty());

        engine.start();
        assert!(drain(&rx).is_empty());
        engine.tick();
        let notes = drain(&rx);
        assert_eq!(notes[0], Notification::Start(0));
        assert!(matches!(notes[1], Notification::Tick(_)));

        engine.stop();
        assert_eq!(drain(&rx), vec![Notification::Rate(0.0)]);
        engine.tick();
        let notes = drain(&rx);
        assert_eq!(notes.len(), 1);
        assert!(matches!(notes[0], Notification::Stop(_)));

        engine.tick();
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn running_clock_advances_with_rate() {
        let engine = TickEngine::manual(1_000);
        engine.set_rate(2.0);
        engine.start();
        thread::sleep(Duration::from_millis(20));
        engine.tick();
        assert!(engine.time() >= 1_040);
    }

    #[test]
    fn set_time_is_refused_while_running() {
        let engine = TickEngine::manual(500);
        let rx = recorded(&engine);
        engine.start();

        assert!(!engine.set_time(9_000));
        assert!(engine.is_stopped());
        assert!(engine.time() < 9_000);
        assert_eq!(engine.rate(), 0.0);
        assert_eq!(drain(&rx), vec![Notification::Rate(0.0)]);

        assert!(engine.set_time(9_000));
        assert_eq!(engine.time(), 9_000);
        assert_eq!(drain(&rx), vec![Notification::Step(9_000)]);
    }

    #[test]
    fn steps_clamp_at_zero() {
        let engine = TickEngine::manual(100);
        let rx = recorded(&engine);
        assert!(engine.step_time(-250));
        assert_eq!(engine.time(), 0);
        assert!(engine.set_time_silently(40));
        assert_eq!(engine.time(), 40);
        assert_eq!(drain(&rx), vec![Notification::Step(0)]);
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let engine = TickEngine::manual(0);
        let (tx, rx) = crossbeam_channel::unbounded();
        let listener: Arc<dyn ClockListener> = Arc::new(Recorder(tx));
        engine.register_listener(listener.clone());
        assert!(engine.remove_listener(&listener));
        engine.set_rate(1.5);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn tick_thread_emits_monotonic_ticks() {
        let engine = TickEngine::new(&TickConfig { period_ms: 5 }).unwrap();
        let rx = recorded(&engine);
        engine.start();

        let mut ticks = Vec::new();
        while ticks.len() < 5 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                Notification::Tick(time) => ticks.push(time),
                Notification::Start(_) => assert!(ticks.is_empty()),
                other => panic!("unexpected notification {other:?}"),
            }
        }
        assert!(ticks.windows(2).all(|pair| pair[0] <= pair[1]));
        drop(engine);
    }
}
