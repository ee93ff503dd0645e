//! postrider: a small outbound SMTP relay.
//!
//! Authenticated clients submit messages, the relay DKIM-signs them,
//! persists one durable delivery job per recipient and drives delivery to
//! the recipients' MX hosts with retry and TLS negotiation fallback.

mod relay;
mod tls;

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use postrider_common::{config::Config, logging};
use tracing::error;

use crate::relay::Relay;

/// Exit code for failures before the relay was up.
const EXIT_INIT_FAILURE: u8 = 13;

/// Exit code for a relay that died while serving.
const EXIT_SERVE_FAILURE: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "postrider")]
#[command(about = "A small outbound SMTP relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    logging::init(&config.log_level);

    let relay = match Relay::start(&config).await {
        Ok(relay) => relay,
        Err(err) => {
            error!(%err, "failed to start relay");
            return ExitCode::from(EXIT_INIT_FAILURE);
        }
    };

    match relay.run_until_signal().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "relay failed");
            ExitCode::from(EXIT_SERVE_FAILURE)
        }
    }
}
