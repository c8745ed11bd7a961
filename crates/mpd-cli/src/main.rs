//! mpd-console - talk to an mpd daemon
//!
//! With a command on the command line it sends that one request and prints
//! the replies. Without one it reads requests from stdin, one per line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mpd_core::config::{DEFAULT_CONFIG_FILE, DEFAULT_PHRASE, DEFAULT_PORT, MpdConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod client;

use client::{ConsoleClient, DEFAULT_TIMEOUT_SECS, join_words};

/// mpd-console - talk to an mpd daemon
#[derive(Parser, Debug)]
#[command(name = "mpd-console")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Daemon port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Shared passphrase (falls back to the configuration file)
    #[arg(long, env = "MPD_PHRASE", hide_env_values = true)]
    phrase: Option<String>,

    /// Path to the daemon configuration file, read for the passphrase
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Seconds to wait for each reply
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Request to send; omit to read requests from stdin
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let phrase = resolve_phrase(&cli);
    let mut console = ConsoleClient::connect(
        &cli.host,
        cli.port,
        &phrase,
        Duration::from_secs(cli.timeout),
    )
    .await?;

    if !cli.command.is_empty() {
        let line = join_words(&cli.command);
        for reply in console.request(&line).await? {
            println!("{reply}");
        }
        console.close().await;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit" | "done") {
            break;
        }
        match console.request(line).await {
            Ok(replies) => {
                for reply in replies {
                    println!("{reply}");
                }
            },
            Err(client::ClientError::Request(e)) => eprintln!("error: {e}"),
            Err(e) => return Err(e.into()),
        }
    }
    console.close().await;
    Ok(())
}

fn resolve_phrase(cli: &Cli) -> String {
    if let Some(phrase) = &cli.phrase {
        return phrase.clone();
    }
    if cli.config.exists() {
        match MpdConfig::from_file(&cli.config) {
            Ok(config) => return config.phrase,
            Err(e) => warn!(path = %cli.config.display(), error = %e, "ignoring configuration file"),
        }
    }
    DEFAULT_PHRASE.to_string()
}
