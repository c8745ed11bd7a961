//! mpd - ring process-manager daemon
//!
//! Loads `mpd.toml`, applies command-line overrides, binds the ring port and
//! runs until SIGINT, SIGTERM, `shutdown` or `exitall`. After `restart` the
//! process re-executes itself with the same arguments.
//!
//! The tokio runtime is built by hand in a synchronous `main` so that nothing
//! spawns threads before the arguments and configuration have been read.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use mpd_core::config::{ConfigStore, DEFAULT_CONFIG_FILE, MpdConfig};
use mpd_daemon::{DaemonOptions, SharedState, Stopped};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// mpd - ring process-manager daemon
#[derive(Parser, Debug)]
#[command(name = "mpd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Name this node goes by on the ring (defaults to the system host name)
    #[arg(long)]
    host: Option<String>,

    /// Ring port (0 binds an ephemeral port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared passphrase
    #[arg(long, env = "MPD_PHRASE", hide_env_values = true)]
    phrase: Option<String>,

    /// Join the ring by inserting next to this node
    #[arg(long)]
    insert: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    let stopped = runtime.block_on(async_main(args))?;
    drop(runtime);
    if stopped == Stopped::Restart {
        return reexec();
    }
    Ok(())
}

/// Replaces this process with a fresh copy of the binary.
fn reexec() -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate the mpd binary")?;
    info!(exe = %exe.display(), "restarting");
    let error = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    Err(error).context("failed to restart mpd")
}

async fn async_main(args: Args) -> Result<Stopped> {
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

    let config = load_config(&args.config, &args)?;
    let mut options = DaemonOptions::new(config);
    options.insert = args.insert.clone();

    let daemon = mpd_daemon::start(options)
        .await
        .context("failed to start mpd")?;
    info!(host = daemon.host(), addr = %daemon.local_addr(), "mpd started");

    let signal_state = daemon.state().clone();
    let signal_task = tokio::spawn(async move {
        if let Err(e) = wait_for_signal(&signal_state).await {
            error!(error = %e, "signal handling failed");
            signal_state.request_shutdown();
        }
    });

    let stopped = daemon.wait().await.context("mpd listener failed")?;
    signal_task.abort();
    Ok(stopped)
}

fn load_config(path: &Path, args: &Args) -> Result<ConfigStore> {
    let mut config = if path.exists() {
        MpdConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?
    } else {
        info!(path = %path.display(), "no configuration file, using defaults");
        MpdConfig::default()
    };
    if let Some(host) = &args.host {
        config.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(phrase) = &args.phrase {
        config.phrase.clone_from(phrase);
    }
    Ok(ConfigStore::with_path(config, path))
}

async fn wait_for_signal(state: &SharedState) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let shutdown = state.shutdown_token();

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        () = shutdown.cancelled() => return Ok(()),
    }

    state.request_shutdown();
    Ok(())
}
