//! usage-relay: one accounting run
//!
//! Usage:
//!   usage-relay --config /etc/usage-relay/client.toml --sender-config /etc/usage-relay/sender.toml
//!
//! Environment:
//!   USAGE_RELAY_CONFIG - client config path
//!   USAGE_RELAY_SENDER_CONFIG - sender config path
//!   RUST_LOG - overrides the configured log level
//!
//! Exit status is 1 only for startup failures (configuration or database);
//! phase failures are logged and reported but do not change it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};

use usage_relay::broker::HttpDirectory;
use usage_relay::config::{ClientConfig, SenderConfig};
use usage_relay::logging::init_logging;
use usage_relay::store::{RecordStore, SqliteRecordStore};
use usage_relay::transport::StompConnector;
use usage_relay::Pipeline;

const FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "usage-relay")]
#[command(about = "Unload accounting records and ship them to the collector")]
struct Args {
    /// Client (phase) configuration
    #[arg(short, long, env = "USAGE_RELAY_CONFIG", default_value = "/etc/usage-relay/client.toml")]
    config: PathBuf,

    /// Sender (broker) configuration
    #[arg(
        short,
        long,
        env = "USAGE_RELAY_SENDER_CONFIG",
        default_value = "/etc/usage-relay/sender.toml"
    )]
    sender_config: PathBuf,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Logging may not be up yet if the client config itself failed.
            eprintln!("usage-relay: {:#}", e);
            error!("Fatal: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let client = ClientConfig::load(&args.config)?;
    init_logging(&client.logging)?;
    info!("Loaded client configuration from {}", args.config.display());

    let sender = if client.sender.enabled {
        let sender = SenderConfig::load(&args.sender_config)?;
        info!("Loaded sender configuration from {}", args.sender_config.display());
        Some(sender)
    } else {
        None
    };

    let pipeline = Pipeline::new(&client, sender.as_ref())?;

    let mut store = SqliteRecordStore::open(&client.db.path)
        .with_context(|| format!("failed to open database {}", client.db.path.display()))?;
    store
        .test_connection()
        .context("database connection check failed")?;

    let timeout = sender
        .as_ref()
        .map_or(FALLBACK_TIMEOUT, |s| s.messaging.timeout());
    // Only consulted with the network strategy, which always has a URL.
    let directory = HttpDirectory::new(pipeline.directory_url().unwrap_or_default(), timeout)?;
    let connector = StompConnector::new(timeout);

    let summary = pipeline.run(&mut store, &directory, &connector);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary.report).context("failed to encode run report")?
        );
    }
    Ok(())
}
