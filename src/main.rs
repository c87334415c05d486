use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use datacoin_listener::{CheckpointPolicy, Listener, ListenerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Poll once (HTTP endpoints only) and exit
    #[arg(long)]
    once: bool,

    /// Poll interval in seconds, overriding POLL_INTERVAL_SECS
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Hold the checkpoint whenever a block could not be fetched
    #[arg(long)]
    strict_checkpoint: bool,

    /// Log level when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ListenerConfig::from_env().context("load configuration")?;
    if let Some(secs) = cli.poll_interval.filter(|s| *s > 0) {
        config.poll_interval = Duration::from_secs(secs);
    }
    if cli.strict_checkpoint {
        config.checkpoint_policy = CheckpointPolicy::Strict;
    }
    tracing::debug!(?config, "configuration loaded");

    let listener = Listener::from_config(&config)?;

    if cli.once {
        return listener.run_once().await;
    }

    tokio::select! {
        res = listener.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    }
}
