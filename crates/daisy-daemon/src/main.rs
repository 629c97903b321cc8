//! Daisy Daemon - Main entry point
//!
//! Finds connected blocks, follows their topology and prints what it sees.

mod config;
mod replay;
mod report;

use anyhow::{bail, Result};
use clap::Parser;
use daisy_discovery::{PhysicalTopologySource, TopologyEvent, TopologySource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::replay::ReplayBackend;
use crate::report::Reporter;

#[derive(Parser, Debug)]
#[command(name = "daisy")]
#[command(about = "BLOCKS discovery and topology daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "daisy.toml")]
    config: PathBuf,

    /// Replay device traffic from a capture file
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Replay a built-in pair of simulated Lightpads
    #[arg(long, conflicts_with = "capture")]
    demo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Exit after the first non-empty topology
    #[arg(long)]
    once: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so stdout stays clean for --json
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Daisy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if args.json {
        config.daemon.json = true;
    }

    let devices = if args.demo {
        replay::demo_capture()?
    } else {
        match args.capture.or_else(|| config.daemon.capture.clone()) {
            Some(path) => replay::load_capture(&path)?,
            None => bail!("No device backend available: pass --capture <file> or --demo"),
        }
    };

    // A recording never answers pings
    if config.source.device_timeout().is_some() {
        debug!("Disabling device timeout for replayed devices");
        config.source.device_timeout_ms = 0;
    }

    info!(
        devices = devices.len(),
        scan_interval_ms = config.source.scan_interval_ms,
        "Configuration loaded"
    );

    let backend = Arc::new(ReplayBackend::new(devices));
    let mut source = PhysicalTopologySource::with_midi_backend(backend, config.source.clone());
    let events = source.subscribe();

    let reporter = Reporter {
        json: config.daemon.json,
        show_input: config.daemon.show_input,
    };
    let once_timeout = Duration::from_secs(config.daemon.once_timeout_secs);

    let outcome = tokio::select! {
        _ = source.run() => Ok(()),
        result = print_events(events, reporter, args.once) => result,
        _ = tokio::time::sleep(once_timeout), if args.once => {
            bail!("No topology within {}s", once_timeout.as_secs())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    if source.is_locked_from_outside() {
        warn!("A device is held by another process");
    }
    source.set_active(false);

    outcome
}

/// Print events until the stream closes, or until the first non-empty
/// topology when `once` is set
async fn print_events(
    mut events: broadcast::Receiver<TopologyEvent>,
    reporter: Reporter,
    once: bool,
) -> Result<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };

        if let Some(text) = reporter.render(&event) {
            println!("{text}");
        }

        if once {
            if let TopologyEvent::TopologyChanged(topology) = &event {
                if !topology.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}
