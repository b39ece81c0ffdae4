//! Command-line entry point: power off a Harmony hub.
//!
//! Loads the optional TOML config, applies command-line overrides, then
//! runs one power-off session with Ctrl-C wired to cooperative
//! cancellation.  The process exit status distinguishes the three
//! user-visible outcomes: 0 = command sent (or dry run verified),
//! 2 = stopped by the user, 1 = failed.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use harmony_client::config::FileConfig;
use harmony_client::session::{Outcome, PowerOffSession};

/// Power off a Logitech Harmony hub from the command line.
#[derive(Debug, Parser)]
#[command(name = "harmony-off", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "HARMONY_OFF_CONFIG")]
    config: Option<PathBuf>,

    /// Hub host or IP (skips discovery).
    #[arg(long)]
    host: Option<String>,

    /// Only accept the discovered hub with this uuid.
    #[arg(long = "hub-uuid")]
    hub_uuid: Option<String>,

    /// Hub XMPP port.
    #[arg(long)]
    port: Option<u16>,

    /// Verify connectivity and pairing without sending the command.
    #[arg(long)]
    dry_run: bool,

    /// Seconds to wait before starting (Ctrl-C cancels the wait too).
    #[arg(long)]
    delay_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(Outcome::Completed) => {
            info!("power-off finished");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Stopped) => {
            warn!("power-off stopped before completion");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Outcome> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FileConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(file.log.level.clone())),
        )
        .init();

    let mut config = file.session_config();
    if cli.host.is_some() {
        config.target_host = cli.host.clone();
    }
    if cli.hub_uuid.is_some() {
        config.hub_uuid = cli.hub_uuid.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.dry_run |= cli.dry_run;
    let delay_secs = cli.delay_secs.unwrap_or(file.run.delay_secs);

    // Ctrl-C requests a cooperative stop; the session unwinds through its
    // normal disconnect paths.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stop requested");
                cancel.cancel();
            }
        });
    }

    if delay_secs > 0 {
        info!("waiting {delay_secs}s before powering off");
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(delay_secs)) => {}
            _ = cancel.cancelled() => {}
        }
    }

    let session = PowerOffSession::new(config).with_progress(|step, last| {
        info!("step {}/{}", step.as_u8(), last.as_u8());
    });

    Ok(session.run(&cancel).await?)
}
