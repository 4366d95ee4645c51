//! Presence Reporter - desktop presence daemon
//!
//! Samples idle time and session lock state, debounces them into a presence
//! state and reports changes to a status service over a persistent
//! WebSocket connection.

mod config;
mod engine;
mod error;
mod logging;
mod presence;
mod probe;
mod session;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::engine::ReportingEngine;
use crate::logging::{EventSink, JournalSink, TracingSink};
use crate::probe::{ActivityProbe, NativeProbe};

/// Application version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on waiting for the engine tasks at exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed command line.
#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    check: bool,
}

impl Args {
    fn parse(args: impl Iterator<Item = String>) -> Self {
        let mut parsed = Args::default();
        for arg in args {
            match arg.as_str() {
                "--check" => parsed.check = true,
                _ if parsed.config_path.is_none() => parsed.config_path = Some(PathBuf::from(arg)),
                _ => {}
            }
        }
        parsed
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse(std::env::args().skip(1));

    // Load configuration
    let config = Config::load(args.config_path.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize tracing
    init_tracing(&config.logging.level)?;

    if args.check {
        return run_check(&config).await;
    }

    info!("Starting presence-reporter v{}", VERSION);
    info!(
        endpoint = %config.server.endpoint,
        device = %config.server.device_id(),
        poll_ms = config.poll.interval_ms,
        "Configuration loaded"
    );

    let sink: Arc<dyn EventSink> = if config.logging.journal {
        let logs_dir = config.logging.logs_dir();
        match JournalSink::new(logs_dir.clone()) {
            Ok(sink) => {
                info!("Writing event journal to {:?}", logs_dir);
                Arc::new(sink)
            }
            Err(e) => {
                warn!("Event journal disabled: {:#}", e);
                Arc::new(TracingSink)
            }
        }
    } else {
        Arc::new(TracingSink)
    };

    let probe = NativeProbe::new().context("Failed to initialize activity probe")?;
    let mut engine = ReportingEngine::new(config, probe, sink)?;
    engine.start()?;

    let updates = engine.on_update(|snapshot| {
        info!(
            connected = snapshot.connection.is_connected(),
            connection = ?snapshot.connection,
            active = snapshot.presence.as_ref().map(|p| p.active),
            paused = snapshot.paused,
            "Status"
        );
    });

    wait_for_shutdown(&engine).await?;
    info!("Shutdown signal received");

    if let Err(e) = engine.shutdown(SHUTDOWN_TIMEOUT).await {
        error!("Unclean shutdown: {}", e);
    }
    let _ = updates.await;

    info!("presence-reporter stopped");
    Ok(())
}

/// Serve control signals until asked to stop.
///
/// SIGUSR1 toggles pause, SIGUSR2 forces a refresh.
#[cfg(unix)]
async fn wait_for_shutdown<P: ActivityProbe>(engine: &ReportingEngine<P>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut toggle = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut refresh = signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let snapshots = engine.subscribe();

    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => return r.context("Failed to listen for shutdown signal"),
            _ = terminate.recv() => return Ok(()),
            _ = toggle.recv() => {
                let paused = snapshots.borrow().paused;
                if paused {
                    engine.resume();
                } else {
                    engine.pause();
                }
            }
            _ = refresh.recv() => engine.force_refresh(),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown<P: ActivityProbe>(_engine: &ReportingEngine<P>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")
}

/// Single connect and hello exchange, then exit.
async fn run_check(config: &Config) -> Result<()> {
    let url = config.server.websocket_url()?;
    info!("Checking {}", url);

    match session::check_endpoint(config).await {
        Ok(round_trip) => {
            println!("ok: {} answered in {} ms", url, round_trip.as_millis());
            Ok(())
        }
        Err(e) => {
            println!("failed ({}): {}", e.kind(), e);
            Err(e).context("Connectivity check failed")
        }
    }
}

/// Initialize tracing subscriber with the given log level.
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
