//! `fleetlink` – run one fleet agent.
//!
//! The binary:
//!
//! 1. Loads the TOML config given with `--config` and applies `FLEETLINK_*`
//!    overrides.
//! 2. Initialises structured logging (and OTLP export when
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` is set).
//! 3. Starts the agent, registers every `[[subscriptions]]` entry, and
//!    optionally publishes one `--ping`.
//! 4. Re-announces itself every `reannounce_interval_secs` seconds.
//! 5. Stops the listener cleanly on Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! fleetlink --config agent1.toml
//! fleetlink --config agent2.toml --ping Ping Ping
//! ```

mod config;
mod responder;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fleetlink_middleware::FleetAgent;
use tracing::{info, warn};

use crate::responder::ReplyHandler;

/// Broker-less pub/sub agent for a vehicle fleet
#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: PathBuf,

    /// Publish PAYLOAD on TOPIC once the agent is up
    #[arg(long, num_args = 2, value_names = ["TOPIC", "PAYLOAD"])]
    ping: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let cfg = config::load(&args.config)?;
    let _guard = telemetry::init_tracing("fleetlink", cfg.log_format);
    info!(config = %args.config.display(), identity = %cfg.identity, "config loaded");

    let agent = FleetAgent::start(cfg.agent_config()).await?;
    info!(identity = %agent.identity(), addr = %agent.local_addr(), "listening");

    for sub in &cfg.subscriptions {
        let handler = ReplyHandler::new(agent.clone(), sub.topic.clone(), sub.reply.clone());
        agent.subscribe_to_topic(&sub.topic, Arc::new(handler)).await?;
    }

    if let Some([topic, payload]) = args.ping.as_deref() {
        match agent.publish_to_topic(topic, payload).await {
            Ok(report) => info!(
                topic = %topic,
                delivered = report.succeeded.len(),
                failed = report.failed.len(),
                "ping sent"
            ),
            Err(e) => warn!(topic = %topic, error = %e, "ping not sent"),
        }
    }

    let reannounce = cfg.reannounce_interval().map(|period| {
        let agent = agent.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; startup already announced.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                agent.announce_self().await;
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    if let Some(task) = reannounce {
        task.abort();
    }
    let served = agent.shutdown().await?;
    info!(served, "bye");
    Ok(())
}
