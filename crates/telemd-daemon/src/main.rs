//! telemd-daemon - local telemetry ingestion daemon
//!
//! Binds the collector socket, then runs the single-threaded event loop until
//! SIGTERM/SIGINT or the optional idle-exit window elapses. Fatal errors
//! (allocation failure, poll failure) exit non-zero.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use telemd_core::config::CollectorConfig;
use telemd_daemon::protocol::{bind_listener, remove_socket};
use telemd_daemon::{Collector, DaemonContext, ExitReason};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Configuration read when `--config` is not given, if it exists.
const DEFAULT_CONFIG_PATH: &str = "/etc/telemd/telemd.toml";

/// Raised by the SIGTERM/SIGINT handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// telemd daemon - local telemetry record collector
#[derive(Parser, Debug)]
#[command(name = "telemd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the listening Unix socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory staged records are written to
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (logs to stdout if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

extern "C" fn handle_shutdown(_: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[allow(unsafe_code)]
fn install_signal_handlers() -> Result<()> {
    // No SA_RESTART: poll(2) must return EINTR so the loop sees the flag.
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("failed to install {signal} handler"))?;
    }
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<CollectorConfig> {
    let mut config = match &args.config {
        Some(path) => CollectorConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            CollectorConfig::from_file(Path::new(DEFAULT_CONFIG_PATH))
                .with_context(|| format!("failed to load config from {DEFAULT_CONFIG_PATH}"))?
        },
        None => {
            info!("No configuration file, using defaults");
            CollectorConfig::default()
        },
    };

    if let Some(socket) = &args.socket {
        config.daemon.socket_path.clone_from(socket);
    }
    if let Some(spool_dir) = &args.spool_dir {
        config.daemon.spool_dir.clone_from(spool_dir);
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(&args)?;
    let socket_path = config.daemon.socket_path.clone();

    let ctx = DaemonContext::new(config);
    ctx.stager()
        .ensure_spool_dir()
        .context("failed to prepare spool directory")?;
    if let Err(e) = ctx.identity().maintain() {
        warn!(error = %e, "Failed to initialize machine id");
    }

    install_signal_handlers()?;

    let listener = bind_listener(&socket_path).context("failed to bind collector socket")?;
    let mut collector = Collector::new(ctx, listener).context("failed to start collector")?;

    let result = collector.run(&SHUTDOWN);
    remove_socket(&socket_path);

    match result {
        Ok(ExitReason::Shutdown) => info!("Shutdown requested, exiting"),
        Ok(ExitReason::Idle) => info!("Idle timeout reached, exiting"),
        Err(e) => {
            error!(error = %e, "Fatal error, exiting");
            return Err(e).context("collector failed");
        },
    }
    Ok(())
}
