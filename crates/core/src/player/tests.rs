use std::{thread, time::Duration};

use crossbeam_channel::Sender;

use super::*;
use crate::{
    backend::{BackendCall, SimulatedBackend, SimulatedMedia},
    config::SyncConfig,
    sync::{ClockSynchronizer, SyncOutcome},
    test_support::{self, wait_for_error, wait_for_state, Harness},
};

fn harness() -> Harness {
    test_support::open(SimulatedMedia::default(), SessionConfig::default())
}

fn playing() -> Harness {
    let harness = harness();
    harness.session.play().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
    harness
}

fn seeks(harness: &Harness) -> Vec<BackendCall> {
    harness
        .probe
        .calls()
        .into_iter()
        .filter(|call| matches!(call, BackendCall::Seek { .. }))
        .collect()
}

fn seek(time: f64, mode: SeekMode) -> BackendCall {
    BackendCall::Seek { time, mode }
}

#[test]
fn dispose_releases_the_backend_once() {
    let Harness { session, probe, .. } = harness();

    session.dispose();
    session.dispose();
    session.dispose();

    assert_eq!(probe.dispose_count(), 1);
    assert!(session.is_disposed());
    assert_eq!(session.state(), None);
    assert!(matches!(session.play(), Err(PlayerError::AlreadyDisposed)));
    assert!(matches!(session.seek(1.0), Err(PlayerError::AlreadyDisposed)));
    assert!(matches!(session.volume(), Err(PlayerError::AlreadyDisposed)));

    drop(session);
    assert_eq!(probe.dispose_count(), 1);
}

#[test]
fn unmute_restores_the_latest_volume() {
    let Harness { session, probe, .. } = harness();

    session.set_volume(0.8).unwrap();
    session.set_mute(true).unwrap();
    assert_eq!(probe.volume(), 0.0);
    session.set_volume(0.3).unwrap();
    session.set_volume(0.6).unwrap();
    assert_eq!(probe.volume(), 0.0);
    session.set_mute(false).unwrap();

    assert_eq!(probe.volume(), 0.6);
    assert_eq!(session.volume().unwrap(), 0.6);
    assert!(!session.is_muted().unwrap());
}

#[test]
fn seek_is_clamped_into_the_stream() {
    let harness = harness();
    harness.session.seek(-5.0).unwrap();
    harness.session.seek(110.0).unwrap();
    harness.session.seek(f64::NAN).unwrap();

    assert_eq!(
        seeks(&harness),
        vec![
            seek(0.0, SeekMode::Accurate),
            seek(10.0, SeekMode::Accurate),
            seek(0.0, SeekMode::Accurate),
        ]
    );
}

#[test]
fn seek_past_unknown_duration_is_not_clamped() {
    let harness = test_support::open(
        SimulatedMedia {
            duration: None,
            ..SimulatedMedia::default()
        },
        SessionConfig::default(),
    );
    assert_eq!(harness.session.duration().unwrap(), f64::INFINITY);
    harness.session.seek(50.0).unwrap();
    assert_eq!(seeks(&harness), vec![seek(50.0, SeekMode::Accurate)]);
}

#[test]
fn stop_then_play_resumes_at_the_start_bound() {
    let harness = harness();
    let session = &harness.session;

    session.set_start_time(2.0).unwrap();
    assert_eq!(seeks(&harness), vec![seek(2.0, SeekMode::Accurate)]);

    session.play().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
    session.seek(7.0).unwrap();
    session.stop().unwrap();
    wait_for_state(&harness.events, PlayerState::Stopped);

    harness.probe.clear_calls();
    session.play().unwrap();
    assert_eq!(
        harness.probe.calls(),
        vec![seek(2.0, SeekMode::Accurate), BackendCall::Play]
    );

    // Only a stop arms the start seek.
    wait_for_state(&harness.events, PlayerState::Playing);
    session.pause().unwrap();
    wait_for_state(&harness.events, PlayerState::Paused);
    harness.probe.clear_calls();
    session.play().unwrap();
    assert_eq!(harness.probe.calls(), vec![BackendCall::Play]);
}

#[test]
fn start_time_set_while_stopped_waits_for_play() {
    let harness = playing();
    let session = &harness.session;
    session.stop().unwrap();
    wait_for_state(&harness.events, PlayerState::Stopped);

    harness.probe.clear_calls();
    session.set_start_time(3.0).unwrap();
    assert!(seeks(&harness).is_empty());
    assert_eq!(session.start_time(), 3.0);

    session.play().unwrap();
    assert_eq!(
        harness.probe.calls(),
        vec![seek(3.0, SeekMode::Accurate), BackendCall::Play]
    );
}

#[test]
fn seek_mode_follows_rate_while_playing() {
    let harness = playing();
    let session = &harness.session;

    session.set_rate(-0.5).unwrap();
    session.seek(3.0).unwrap();
    session.set_rate(2.0).unwrap();
    session.seek(4.0).unwrap();
    session.seek_with_mode(5.0, SeekMode::Accurate).unwrap();

    assert_eq!(
        seeks(&harness),
        vec![
            seek(3.0, SeekMode::Accurate),
            seek(4.0, SeekMode::Fast),
            seek(5.0, SeekMode::Accurate),
        ]
    );
}

#[test]
fn stop_resets_the_rate() {
    let harness = playing();
    harness.session.set_rate(2.0).unwrap();
    harness.probe.clear_calls();

    harness.session.stop().unwrap();
    assert_eq!(
        harness.probe.calls(),
        vec![BackendCall::Stop, BackendCall::SetRate(1.0)]
    );
    assert_eq!(harness.session.rate().unwrap(), 1.0);
}

#[test]
fn native_failures_arrive_as_error_events() {
    let harness = harness();
    harness.probe.fail("play", StatusCode(-9));

    assert!(harness.session.play().is_ok());
    let (code, message) = wait_for_error(&harness.events);
    assert_eq!(code, -9);
    assert!(message.contains("-9"));
}

#[test]
fn missing_balance_control_is_reported_as_unsupported() {
    let harness = harness();

    assert!(harness.session.set_balance(0.5).is_ok());
    let (code, message) = wait_for_error(&harness.events);
    assert_eq!(code, StatusCode::UNSUPPORTED.0);
    assert!(message.contains("set_balance"));
    assert_eq!(harness.session.balance().unwrap(), 0.0);
}

#[test]
fn halted_session_only_accepts_dispose() {
    let harness = harness();
    assert!(harness.probe.emit(PlayerState::Halted));
    wait_for_state(&harness.events, PlayerState::Halted);

    assert_eq!(harness.session.state(), Some(PlayerState::Halted));
    assert!(matches!(
        harness.session.play(),
        Err(PlayerError::SessionHalted)
    ));
    assert!(matches!(
        harness.session.set_volume(0.1),
        Err(PlayerError::SessionHalted)
    ));

    harness.session.dispose();
    assert_eq!(harness.probe.dispose_count(), 1);
}

#[test]
fn init_failure_is_returned_synchronously() {
    let (backend, probe) = SimulatedBackend::new(SimulatedMedia::default());
    probe.fail("init", StatusCode(5));

    let config = SessionConfig::default();
    let err = PlaybackSession::open(backend, OpenRequest::new("sim://broken", &config), &config)
        .unwrap_err();
    assert!(matches!(err, PlayerError::BackendInitFailure { code: 5 }));
}

#[test]
fn toggle_pause_flips_between_playing_and_paused() {
    let harness = playing();
    harness.session.toggle_pause().unwrap();
    wait_for_state(&harness.events, PlayerState::Paused);
    harness.session.toggle_pause().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
}

#[test]
fn crossing_the_stop_bound_pauses_once() {
    let harness = playing();
    let session = &harness.session;
    session.set_stop_time(0.05).unwrap();

    thread::sleep(Duration::from_millis(100));
    session.update_current_time().unwrap();
    wait_for_state(&harness.events, PlayerState::Paused);
    assert!(session.current_time() >= 0.05);

    harness.probe.clear_calls();
    session.update_current_time().unwrap();
    assert!(harness.probe.calls().is_empty());
}

#[test]
fn stop_action_can_stop_instead() {
    let config = SessionConfig {
        stop_action: StopAction::Stop,
        ..SessionConfig::default()
    };
    let harness = test_support::open(SimulatedMedia::default(), config);
    harness.session.play().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
    harness.session.set_stop_time(0.0).unwrap();

    harness.session.update_current_time().unwrap();
    wait_for_state(&harness.events, PlayerState::Stopped);
}

#[test]
fn poller_tracks_playing_sessions_only() {
    let harness = harness();
    let poller = SessionPoller::new(&harness.session);
    harness.probe.pin_presentation_time(Some(4.0));

    assert!(poller.poll());
    assert_eq!(harness.session.current_time(), 0.0);

    harness.session.play().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
    assert!(harness.session.periodic_updates_enabled());
    assert!(poller.poll());
    assert_eq!(harness.session.current_time(), 4.0);

    let Harness { session, .. } = harness;
    drop(session);
    assert!(!poller.poll());
}

struct DisposeOnPause {
    session: Mutex<Weak<PlaybackSession>>,
    done: Sender<()>,
}

impl PlayerStateListener for DisposeOnPause {
    fn on_pause(&self, _event: &PlayerStateEvent) {
        if let Some(session) = self.session.lock().upgrade() {
            session.dispose();
            let _ = self.done.send(());
        }
    }
}

#[test]
fn listener_may_dispose_its_own_session() {
    let harness = playing();
    let (done, finished) = crossbeam_channel::unbounded();
    let listener = Arc::new(DisposeOnPause {
        session: Mutex::new(Arc::downgrade(&harness.session)),
        done,
    });
    harness.session.add_state_listener(&listener);

    harness.session.pause().unwrap();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(harness.session.is_disposed());
    assert_eq!(harness.probe.dispose_count(), 1);
}

#[test]
fn removed_listener_stops_receiving_events() {
    let harness = harness();
    let (extra, extra_events) = test_support::Recorder::new();
    harness.session.add_state_listener(&extra);
    let as_dyn: Arc<dyn PlayerStateListener> = extra.clone();
    assert!(harness.session.remove_state_listener(&as_dyn));

    harness.session.play().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
    assert!(extra_events.try_recv().is_err());
}

#[derive(Debug, PartialEq)]
enum SinkEvent {
    Data(usize),
    End,
}

struct ChannelSink(Sender<SinkEvent>);

impl FrameSink for ChannelSink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0
            .send(SinkEvent::Data(data.len()))
            .map_err(|_| PlayerError::msg("sink receiver gone"))
    }

    fn end_of_stream(&mut self) {
        let _ = self.0.send(SinkEvent::End);
    }
}

#[test]
fn output_worker_feeds_the_sink_until_dispose() {
    let harness = harness();
    let (tx, rx) = crossbeam_channel::unbounded();
    harness
        .session
        .attach_output(Modality::Audio, Box::new(ChannelSink(tx)))
        .unwrap();

    harness.session.play().unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        SinkEvent::Data(4096)
    );

    harness.session.dispose();
    let tail: Vec<_> = rx.try_iter().collect();
    assert_eq!(tail.last(), Some(&SinkEvent::End));
    assert!(harness
        .probe
        .calls()
        .iter()
        .any(|call| *call == BackendCall::Finish));
    assert_eq!(harness.probe.dispose_count(), 1);
}

#[test]
fn image_output_uses_frame_sized_buffers() {
    let harness = playing();
    let (tx, rx) = crossbeam_channel::unbounded();
    harness
        .session
        .attach_output(Modality::Image, Box::new(ChannelSink(tx)))
        .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        SinkEvent::Data(320 * 240 * 3)
    );
}

#[test]
fn synchronizer_realigns_a_drifting_session() {
    let harness = harness();
    harness.probe.pin_presentation_time(Some(1.0));
    let sync = ClockSynchronizer::new(harness.session.clone(), &SyncConfig::default());

    assert!(matches!(
        sync.update_master_time(1_010),
        SyncOutcome::WithinTolerance { .. }
    ));
    assert_eq!(harness.session.current_time(), 1.0);
    assert!(seeks(&harness).is_empty());

    harness.probe.pin_presentation_time(Some(1.2));
    assert!(sync.update_master_time(2_000).is_correction());
    assert_eq!(seeks(&harness), vec![seek(2.0, SeekMode::Accurate)]);
    assert_eq!(harness.session.current_time(), 2.0);
    assert_eq!(harness.probe.position(), 2.0);
}

#[test]
fn steps_and_properties_pass_through() {
    let harness = harness();
    let session = &harness.session;

    session.step_forward().unwrap();
    session.step_backward().unwrap();
    session.set_audio_sync_delay(-40).unwrap();
    assert_eq!(
        harness.probe.calls()[1..],
        [
            BackendCall::StepForward,
            BackendCall::StepBackward,
            BackendCall::SetAudioSyncDelay(-40),
        ]
    );

    assert_eq!(session.audio_sync_delay().unwrap(), -40);
    assert_eq!(session.fps().unwrap(), Some(30.0));
    assert_eq!(session.duration().unwrap(), 10.0);
    assert_eq!(session.image_width().unwrap(), Some(320));
    assert_eq!(session.image_height().unwrap(), Some(240));
    assert_eq!(
        session.color_space().unwrap(),
        Some(session.config().color_space)
    );
    assert!(session.has_audio().unwrap());
    assert!(session.has_image().unwrap());
    assert!(session.is_rate_supported(-2.0).unwrap());
    assert!(!session.is_rate_supported(f32::NAN).unwrap());
}

#[test]
fn dispose_releases_an_outside_puller() {
    let harness = harness();
    let session = harness.session.clone();
    let puller = thread::spawn(move || {
        let mut buffer = [0_u8; 64];
        session.update_audio_data(&mut buffer)
    });
    // Ready, not playing: the pull blocks inside the backend.
    thread::sleep(Duration::from_millis(50));

    let (done, disposed) = crossbeam_channel::bounded(1);
    let session = harness.session.clone();
    thread::spawn(move || {
        session.dispose();
        let _ = done.send(());
    });

    disposed.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(harness.probe.dispose_count(), 1);
    assert!(matches!(
        puller.join().unwrap(),
        Ok(BufferFill::EndOfStream)
    ));
}

#[test]
fn start_bound_past_the_end_seeks_to_the_end() {
    let harness = harness();
    let session = &harness.session;

    session.set_start_time(100.0).unwrap();
    assert_eq!(seeks(&harness), vec![seek(10.0, SeekMode::Accurate)]);

    session.play().unwrap();
    wait_for_state(&harness.events, PlayerState::Playing);
    session.stop().unwrap();
    wait_for_state(&harness.events, PlayerState::Stopped);
    session.set_start_time(50.0).unwrap();

    harness.probe.clear_calls();
    session.play().unwrap();
    assert_eq!(
        harness.probe.calls(),
        vec![seek(10.0, SeekMode::Accurate), BackendCall::Play]
    );
}

#[test]
fn session_starts_at_the_backend_volume() {
    let harness = test_support::open(
        SimulatedMedia {
            volume: 0.4,
            ..SimulatedMedia::default()
        },
        SessionConfig::default(),
    );
    let session = &harness.session;
    assert_eq!(session.volume().unwrap(), 0.4);

    session.set_mute(true).unwrap();
    session.set_mute(false).unwrap();
    assert_eq!(harness.probe.volume(), 0.4);
}

#[test]
fn late_error_listener_receives_failures() {
    let harness = harness();
    let (recorder, observed) = test_support::Recorder::new();
    harness.session.add_error_listener(&recorder);
    harness.probe.fail("pause", StatusCode(-3));

    harness.session.pause().unwrap();
    assert_eq!(wait_for_error(&observed).0, -3);
    assert_eq!(wait_for_error(&harness.events).0, -3);
}
