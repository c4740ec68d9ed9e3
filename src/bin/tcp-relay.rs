// src/bin/tcp-relay.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tcp_relay::config::{mappings_from_env_file, parse_mappings, validate};
use tcp_relay::{RelayState, Supervisor};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tcp-relay", author, version, about = "Forward local TCP ports to remote endpoints")]
struct Cli {
    /// Forwarding rule LOCAL_PORT:REMOTE_HOST:REMOTE_PORT (repeatable)
    #[arg(short, long = "map", env = "RELAY_MAPS", value_delimiter = ',')]
    maps: Vec<String>,

    /// Read RELAY_MAPS from this file when no mapping is given otherwise
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Timeout for the startup probe and every outbound connect
    #[arg(long, env = "RELAY_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// How often relay states are polled; 0 disables polling
    #[arg(long, env = "RELAY_STATUS_INTERVAL_SECS", default_value_t = 1)]
    status_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // load .env for local development (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let configs = match (&cli.env_file, cli.maps.is_empty()) {
        (Some(path), true) => mappings_from_env_file(path)
            .with_context(|| format!("invalid relay mappings in {}", path.display()))?,
        _ => parse_mappings(&cli.maps).context("invalid relay mapping")?,
    };

    let validation = validate(&configs);
    validation.print_summary();
    if !validation.valid {
        bail!("configuration has {} error(s)", validation.errors.len());
    }

    let mut supervisor = Supervisor::new(Duration::from_millis(cli.connect_timeout_ms));
    for cfg in configs {
        supervisor.add(cfg);
    }
    supervisor.start_all().await?;
    info!("{} relay(s) launched", supervisor.len());

    let mut ticker = (cli.status_interval_secs > 0).then(|| {
        let mut t = interval(Duration::from_secs(cli.status_interval_secs));
        t.set_missed_tick_behavior(MissedTickBehavior::Skip);
        t
    });
    let mut last_states: Vec<RelayState> = supervisor.status().iter().map(|s| s.state).collect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!("failed to listen for Ctrl+C: {}", e);
                }
                info!("shutdown signal received, stopping relays...");
                break;
            }
            _ = next_tick(&mut ticker) => {
                let statuses = supervisor.status();
                for (status, last) in statuses.iter().zip(last_states.iter_mut()) {
                    if status.state != *last {
                        info!(relay = %status.config.label(), "state {} -> {}", last, status.state);
                        *last = status.state;
                    }
                    debug!("status {}", serde_json::to_string(status)?);
                }
                if statuses.iter().all(|s| s.state == RelayState::Stopped) {
                    warn!("all relays have stopped");
                    break;
                }
            }
        }
    }

    let exits = supervisor.shutdown().await;
    let failures = exits.iter().filter(|(_, exit)| exit.is_failure()).count();
    if failures > 0 {
        bail!("{} relay(s) ended with an error", failures);
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
