//! Periodic corrective synchronisation of sessions against a master clock.
//!
//! A session is allowed to drift freely while it stays within the
//! threshold. Once the drift reaches the threshold a single seek realigns
//! it with the master. There is no rate slaving.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{config::SyncConfig, timeline::ClockListener};

/// A session as seen by the synchronizer.
pub trait SyncTarget: Send + Sync {
    /// Presentation time in seconds, `None` while unknown.
    fn presentation_time(&self) -> Option<f64>;
    /// Realigns the target through its ordinary seek path.
    fn corrective_seek(&self, time: f64);
    /// Records `time` as the target's current time.
    fn adopt_time(&self, time: f64);
}

/// What a single master time push did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// Same master time as the previous push.
    MasterUnchanged,
    /// The target does not know its presentation time.
    TimeUnavailable,
    /// The presentation time has not moved since the previous push.
    Idle,
    WithinTolerance { time: f64, drift: f64 },
    Corrected { to: f64, drift: f64 },
}

impl SyncOutcome {
    pub fn is_correction(&self) -> bool {
        matches!(self, SyncOutcome::Corrected { .. })
    }
}

#[derive(Debug, Default)]
struct Samples {
    master: Option<f64>,
    presentation: Option<f64>,
}

/// Keeps one target aligned with externally pushed master times.
pub struct ClockSynchronizer {
    target: Arc<dyn SyncTarget>,
    threshold: f64,
    force_periodic_update: AtomicBool,
    samples: Mutex<Samples>,
}

impl ClockSynchronizer {
    pub fn new(target: Arc<dyn SyncTarget>, config: &SyncConfig) -> Self {
        Self {
            target,
            threshold: config.threshold_seconds(),
            force_periodic_update: AtomicBool::new(config.force_periodic_update),
            samples: Mutex::new(Samples::default()),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Re-check drift even while the presentation time stands still, for
    /// instance when the master is stepping a paused timeline.
    pub fn set_force_periodic_update(&self, force: bool) {
        self.force_periodic_update.store(force, Ordering::Relaxed);
    }

    pub fn update_master_time(&self, master_ms: i64) -> SyncOutcome {
        let master = master_ms as f64 / 1000.0;
        let mut samples = self.samples.lock();
        if samples.master == Some(master) {
            return SyncOutcome::MasterUnchanged;
        }
        samples.master = Some(master);

        let Some(time) = self.target.presentation_time().filter(|time| *time >= 0.0) else {
            return SyncOutcome::TimeUnavailable;
        };
        let force = self.force_periodic_update.load(Ordering::Relaxed);
        if samples.presentation == Some(time) && !force {
            return SyncOutcome::Idle;
        }
        samples.presentation = Some(time);

        let drift = (time - master).abs();
        if drift >= self.threshold {
            debug!(master, time, drift, "drift over threshold; seeking");
            self.target.corrective_seek(master);
            self.target.adopt_time(master);
            SyncOutcome::Corrected { to: master, drift }
        } else {
            trace!(master, time, drift, "within tolerance");
            self.target.adopt_time(time);
            SyncOutcome::WithinTolerance { time, drift }
        }
    }
}

impl std::fmt::Debug for ClockSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSynchronizer")
            .field("threshold", &self.threshold)
            .field("samples", &*self.samples.lock())
            .finish()
    }
}

/// Fans one master clock out to any number of synchronizers.
///
/// Registered with a [`crate::TickEngine`], the group pushes the master time
/// on every tick, step and stop.
#[derive(Debug, Default)]
pub struct SyncGroup {
    members: Mutex<Vec<Arc<ClockSynchronizer>>>,
}

impl SyncGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, synchronizer: Arc<ClockSynchronizer>) {
        self.members.lock().push(synchronizer);
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, master_ms: i64) -> Vec<SyncOutcome> {
        let members = self.members.lock().clone();
        members
            .iter()
            .map(|member| member.update_master_time(master_ms))
            .collect()
    }
}

impl ClockListener for SyncGroup {
    fn clock_tick(&self, time: i64) {
        self.push(time);
    }

    fn clock_stop(&self, time: i64) {
        self.push(time);
    }

    fn clock_step(&self, time: i64) {
        self.push(time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decodes at its own pace; seeks land exactly on the target.
    #[derive(Default)]
    struct FakeTarget {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        presentation: Option<f64>,
        seeks: Vec<f64>,
        adopted: Vec<f64>,
    }

    impl FakeTarget {
        fn at(time: f64) -> Arc<Self> {
            let target = Arc::new(Self::default());
            target.set(time);
            target
        }

        fn set(&self, time: f64) {
            self.state.lock().presentation = Some(time);
        }

        fn seeks(&self) -> Vec<f64> {
            self.state.lock().seeks.clone()
        }

        fn last_adopted(&self) -> Option<f64> {
            self.state.lock().adopted.last().copied()
        }
    }

    impl SyncTarget for FakeTarget {
        fn presentation_time(&self) -> Option<f64> {
            self.state.lock().presentation
        }

        fn corrective_seek(&self, time: f64) {
            let mut state = self.state.lock();
            state.seeks.push(time);
            state.presentation = Some(time);
        }

        fn adopt_time(&self, time: f64) {
            self.state.lock().adopted.push(time);
        }
    }

    fn synchronizer(target: &Arc<FakeTarget>) -> ClockSynchronizer {
        ClockSynchronizer::new(target.clone(), &SyncConfig::default())
    }

    #[test]
    fn drift_below_threshold_keeps_backend_time() {
        let target = FakeTarget::at(1.010);
        let sync = synchronizer(&target);

        let outcome = sync.update_master_time(1_000);
        assert!(matches!(outcome, SyncOutcome::WithinTolerance { .. }));
        assert!(target.seeks().is_empty());
        assert_eq!(target.last_adopted(), Some(1.010));
    }

    #[test]
    fn drift_at_threshold_seeks_once() {
        let target = FakeTarget::at(2.0);
        let sync = synchronizer(&target);

        let outcome = sync.update_master_time(2_500);
        assert!(outcome.is_correction());
        assert_eq!(target.seeks(), vec![2.5]);
        assert_eq!(target.last_adopted(), Some(2.5));

        assert_eq!(sync.update_master_time(2_500), SyncOutcome::MasterUnchanged);
        assert_eq!(target.seeks().len(), 1);
    }

    #[test]
    fn unknown_presentation_time_is_ignored() {
        let target = Arc::new(FakeTarget::default());
        let sync = synchronizer(&target);
        assert_eq!(sync.update_master_time(4_000), SyncOutcome::TimeUnavailable);

        target.set(-1.0);
        assert_eq!(sync.update_master_time(5_000), SyncOutcome::TimeUnavailable);
        assert!(target.seeks().is_empty());
    }

    #[test]
    fn frozen_presentation_time_is_left_alone_unless_forced() {
        let target = FakeTarget::at(3.0);
        let sync = synchronizer(&target);
        assert!(matches!(
            sync.update_master_time(3_000),
            SyncOutcome::WithinTolerance { .. }
        ));

        // Paused at 3.0 while the master moves on.
        assert_eq!(sync.update_master_time(4_000), SyncOutcome::Idle);
        assert!(target.seeks().is_empty());

        sync.set_force_periodic_update(true);
        assert!(sync.update_master_time(5_000).is_correction());
        assert_eq!(target.seeks(), vec![5.0]);
    }

    #[test]
    fn shared_master_converges_every_member_in_one_cycle() {
        let slow = FakeTarget::at(0.0);
        let fast = FakeTarget::at(0.0);
        let group = SyncGroup::new();
        group.add(Arc::new(synchronizer(&slow)));
        group.add(Arc::new(synchronizer(&fast)));

        for master_ms in [1_000_i64, 2_000, 3_000] {
            let master = master_ms as f64 / 1000.0;
            // Both decode with skew between pushes.
            slow.set(master - 0.4);
            fast.set(master + 0.25);

            let outcomes = group.push(master_ms);
            assert!(outcomes.iter().all(SyncOutcome::is_correction));
            for target in [&slow, &fast] {
                let adopted = target.last_adopted().unwrap();
                assert!((adopted - master).abs() < 0.030);
            }
        }
        assert_eq!(slow.seeks(), vec![1.0, 2.0, 3.0]);
        assert_eq!(fast.seeks(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn group_follows_clock_steps() {
        let target = FakeTarget::at(0.0);
        let group = Arc::new(SyncGroup::new());
        group.add(Arc::new(synchronizer(&target)));
        let clock = crate::timeline::TickEngine::manual(0);
        clock.register_listener(group.clone());

        assert!(clock.set_time(1_500));
        assert_eq!(target.seeks(), vec![1.5]);
    }
}
