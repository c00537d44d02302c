use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use media_sync_core::{
    ClockListener, ClockSynchronizer, EngineConfig, MediaErrorListener, OpenRequest,
    PlaybackSession, PlayerStateEvent, PlayerStateListener, SessionId, SessionPoller,
    SimulatedBackend, SimulatedMedia, SyncGroup, TickEngine,
};
use tracing_subscriber::EnvFilter;

fn main() -> media_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo(args) => run_demo(&args),
        Commands::Config { config } => print_config(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> media_sync_core::Result<EngineConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            EngineConfig::load(path)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn print_config(path: Option<&Path>) -> media_sync_core::Result<()> {
    let config = load_config(path)?;
    println!("{}", config.to_json_pretty()?);
    Ok(())
}

fn run_demo(args: &DemoArgs) -> media_sync_core::Result<()> {
    let config = load_config(args.config.as_deref())?;
    tracing::info!(
        sessions = args.sessions,
        seconds = args.seconds,
        skew = args.skew,
        "starting synchronisation demo"
    );

    let master = TickEngine::new(&config.tick)?;
    let group = Arc::new(CountingGroup::default());
    let logger = Arc::new(EventLogger);

    let mut sessions = Vec::with_capacity(args.sessions);
    for index in 0..args.sessions {
        let media = SimulatedMedia {
            duration: Some(args.duration),
            skew: 1.0 + index as f64 * args.skew / 100.0,
            ..SimulatedMedia::default()
        };
        let (backend, _probe) = SimulatedBackend::new(media);
        let request = OpenRequest::new(format!("sim://stream-{index}"), &config.session);
        let session = PlaybackSession::builder(backend, request)
            .config(config.session.clone())
            .state_listener(&logger)
            .error_listener(&logger)
            .open()?;

        if let Some(start) = args.start {
            session.set_start_time(start)?;
        }
        if let Some(stop) = args.stop {
            session.set_stop_time(stop)?;
        }
        group
            .inner
            .add(Arc::new(ClockSynchronizer::new(session.clone(), &config.sync)));
        master.register_listener(Arc::new(SessionPoller::new(&session)));
        sessions.push(session);
    }
    master.register_listener(group.clone());

    let start_ms = (args.start.unwrap_or(0.0) * 1000.0) as i64;
    master.set_time(start_ms);
    for session in &sessions {
        session.play()?;
    }
    master.start();

    thread::sleep(Duration::from_secs_f64(args.seconds.max(0.0)));
    master.stop();

    let master_time = master.time() as f64 / 1000.0;
    for session in &sessions {
        tracing::info!(
            session = %session.id(),
            master = master_time,
            current = session.current_time(),
            presentation = ?session.presentation_time()?,
            state = ?session.state(),
            "final position"
        );
        session.dispose();
    }
    tracing::info!(
        corrections = group.corrections.load(Ordering::Relaxed),
        "demo finished"
    );
    Ok(())
}

/// Master clock consumer that counts corrective seeks across the group.
#[derive(Default)]
struct CountingGroup {
    inner: SyncGroup,
    corrections: AtomicUsize,
}

impl CountingGroup {
    fn push(&self, time: i64) {
        let corrected = self
            .inner
            .push(time)
            .iter()
            .filter(|outcome| outcome.is_correction())
            .count();
        if corrected > 0 {
            tracing::debug!(time, corrected, "sessions realigned");
            self.corrections.fetch_add(corrected, Ordering::Relaxed);
        }
    }
}

impl ClockListener for CountingGroup {
    fn clock_tick(&self, time: i64) {
        self.push(time);
    }

    fn clock_step(&self, time: i64) {
        self.push(time);
    }

    fn clock_stop(&self, time: i64) {
        self.push(time);
    }
}

struct EventLogger;

impl EventLogger {
    fn log(&self, event: &PlayerStateEvent) {
        tracing::info!(session = %event.source, state = ?event.state, time = event.time, "state");
    }
}

impl PlayerStateListener for EventLogger {
    fn on_ready(&self, event: &PlayerStateEvent) {
        self.log(event);
    }
    fn on_playing(&self, event: &PlayerStateEvent) {
        self.log(event);
    }
    fn on_pause(&self, event: &PlayerStateEvent) {
        self.log(event);
    }
    fn on_stop(&self, event: &PlayerStateEvent) {
        self.log(event);
    }
    fn on_stall(&self, event: &PlayerStateEvent) {
        self.log(event);
    }
    fn on_finish(&self, event: &PlayerStateEvent) {
        self.log(event);
    }
    fn on_halt(&self, event: &PlayerStateEvent) {
        tracing::warn!(session = %event.source, time = event.time, "session halted");
    }
}

impl MediaErrorListener for EventLogger {
    fn on_error(&self, source: SessionId, code: i32, message: &str) {
        tracing::warn!(session = %source, code, error = message, "backend error");
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Media playback and clock synchronisation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play several simulated streams against one master clock.
    Demo(DemoArgs),
    /// Print the effective configuration as JSON.
    Config {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Number of simulated sessions.
    #[arg(long, default_value_t = 2)]
    sessions: usize,
    /// Wall-clock seconds to run for.
    #[arg(long, default_value_t = 3.0)]
    seconds: f64,
    /// Extra decode speed per session, in percent. Session `i` runs `i * skew` percent fast.
    #[arg(long, default_value_t = 2.0)]
    skew: f64,
    /// Length of each simulated stream in seconds.
    #[arg(long, default_value_t = 60.0)]
    duration: f64,
    /// Start bound in seconds.
    #[arg(long)]
    start: Option<f64>,
    /// Stop bound in seconds.
    #[arg(long)]
    stop: Option<f64>,
    /// Optional JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}
