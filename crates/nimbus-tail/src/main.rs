//! # nimbus-tail
//!
//! Print Nimbus realtime events as JSON lines.
//!
//! ## Usage
//!
//! ```bash
//! # Tail a table and a channel with credentials from the environment
//! NIMBUS_BASE_URL=https://api.example.com/api/v1 NIMBUS_API_KEY=... \
//!     nimbus-tail --table orders --channel news
//!
//! # Join a presence channel with a config file
//! nimbus-tail --config ./nimbus.toml --presence lobby --user-id ops
//! ```
//!
//! Logs go to stderr so stdout stays machine readable.

mod config;
mod metrics;
mod tail;

use anyhow::{bail, Result};
use clap::Parser;
use nimbus_realtime::RealtimeClient;
use std::path::PathBuf;
use tail::{Output, Targets};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tail Nimbus realtime subscriptions
#[derive(Parser, Debug)]
#[command(name = "nimbus-tail", version, about, long_about = None)]
struct Args {
    /// Configuration file (default: search for nimbus.toml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// REST base URL, e.g. http://localhost:3000/api/v1
    #[arg(short = 'u', long = "base-url")]
    base_url: Option<String>,

    /// Project API key
    #[arg(short = 'k', long = "api-key")]
    api_key: Option<String>,

    /// Table to tail (repeatable)
    #[arg(short = 't', long = "table")]
    tables: Vec<String>,

    /// Broadcast channel to tail (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Presence channel to join and tail (repeatable)
    #[arg(long = "presence")]
    presence: Vec<String>,

    /// Workflow to tail (repeatable)
    #[arg(long = "workflow")]
    workflows: Vec<String>,

    /// User id announced on presence channels
    #[arg(long = "user-id", default_value = "nimbus-tail")]
    user_id: String,

    /// Serve Prometheus metrics on this port
    #[arg(long = "metrics-port")]
    metrics_port: Option<u16>,

    /// Log every frame
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = config::Config::load(args.config.as_deref())?;
    if args.base_url.is_some() {
        config.base_url = args.base_url;
    }
    if args.api_key.is_some() {
        config.api_key = args.api_key;
    }
    if args.verbose {
        config.realtime.debug = true;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    let targets = Targets {
        tables: args.tables,
        channels: args.channels,
        presence: args.presence,
        workflows: args.workflows,
        user_id: args.user_id,
    };
    if targets.is_empty() {
        bail!("nothing to tail: pass --table, --channel, --presence or --workflow");
    }

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (base_url, api_key) = config.credentials()?;
    let client = RealtimeClient::builder()
        .base_url(base_url)
        .api_key(api_key)
        .options(config.realtime.clone())
        .build()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    tail::watch(&client, tx.clone());

    client.connect().await?;
    let _subscriptions = tail::subscribe_all(&client, &targets, &tx)?;
    info!(
        subscriptions = client.get_active_subscriptions().len(),
        channels = client.get_active_channels().len(),
        "Tailing"
    );

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            output = rx.recv() => match output {
                Some(Output::Line(line)) => println!("{line}"),
                Some(Output::Fatal(message)) => break Err(anyhow::anyhow!(message)),
                None => break Ok(()),
            },
        }
    };

    client.disconnect();
    info!("Stopped");
    outcome
}
