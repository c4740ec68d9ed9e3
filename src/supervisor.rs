// src/supervisor.rs
// Collaborator-side management of relay engines: one worker task per relay,
// clear-before-restart, and manual-stop vs failure labelling of each exit

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::engine::{RelayEngine, RelayState};
use crate::error::RelayError;
use crate::probe::CONNECT_TIMEOUT;
use crate::stats::StatsSnapshot;

/// How a relay worker ended.
#[derive(Debug)]
pub enum RelayExit {
    /// Stopped on request.
    Stopped,
    Failed(RelayError),
    /// The worker task panicked or was aborted.
    Lost,
}

impl RelayExit {
    pub fn is_failure(&self) -> bool {
        !matches!(self, RelayExit::Stopped)
    }
}

/// Status row for one relay, as a management layer would display it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    #[serde(flatten)]
    pub config: RelayConfig,
    pub state: RelayState,
    pub manual_stop: bool,
    pub stats: StatsSnapshot,
}

/// An engine plus the task currently running its `start()`.
pub struct ManagedRelay {
    engine: Arc<RelayEngine>,
    worker: Option<JoinHandle<Result<(), RelayError>>>,
}

impl ManagedRelay {
    pub fn new(config: RelayConfig, connect_timeout: Duration) -> Self {
        Self {
            engine: Arc::new(RelayEngine::with_connect_timeout(config, connect_timeout)),
            worker: None,
        }
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            config: self.engine.config().clone(),
            state: self.engine.state(),
            manual_stop: self.engine.is_manual_stop(),
            stats: self.engine.stats(),
        }
    }

    /// Start the relay on its own task unless it is already running.
    ///
    /// A previous run is reaped and cleared first, so stale fatal or
    /// manual-stop flags never leak into the new run.
    pub async fn launch(&mut self) -> Result<(), RelayError> {
        if self.engine.state() == RelayState::Running {
            return Ok(());
        }
        if let Some(worker) = self.worker.take() {
            // still in INIT means it is binding or probing: let it be
            if self.engine.state() == RelayState::Init && !worker.is_finished() {
                self.worker = Some(worker);
                return Ok(());
            }
            let _ = worker.await;
        }
        self.engine.clear()?;

        let engine = Arc::clone(&self.engine);
        info!(relay = %engine.config().label(), "starting relay");
        self.worker = Some(tokio::spawn(async move { engine.start().await }));
        Ok(())
    }

    /// Ask the relay to stop. A relay that already ended keeps its exit label.
    pub fn stop(&self) {
        if self.engine.state() != RelayState::Stopped {
            self.engine.stop();
        }
    }

    /// Wait for the current worker, if any, and label its exit.
    pub async fn join(&mut self) -> Option<RelayExit> {
        let worker = self.worker.take()?;
        let cfg = self.engine.config();
        let exit = match worker.await {
            Ok(Ok(())) => RelayExit::Stopped,
            Ok(Err(err)) if self.engine.is_manual_stop() => {
                // the stop raced a startup failure; report what the operator asked for
                warn!(relay = %cfg.label(), "relay stopped during startup: {}", err);
                RelayExit::Stopped
            }
            Ok(Err(err)) => RelayExit::Failed(err),
            Err(join_err) => {
                error!(relay = %cfg.label(), "relay worker lost: {}", join_err);
                RelayExit::Lost
            }
        };
        match &exit {
            RelayExit::Stopped => info!(relay = %cfg.label(), "relay stopped"),
            RelayExit::Failed(err) => error!(relay = %cfg.label(), "relay failed: {}", err),
            RelayExit::Lost => {}
        }
        Some(exit)
    }
}

/// A set of relays keyed by their configuration.
pub struct Supervisor {
    relays: Vec<ManagedRelay>,
    connect_timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl Supervisor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            relays: Vec::new(),
            connect_timeout,
        }
    }

    /// Register a relay; adding the same configuration twice is a no-op.
    pub fn add(&mut self, config: RelayConfig) -> &mut ManagedRelay {
        let idx = match self.position(&config) {
            Some(idx) => idx,
            None => {
                self.relays.push(ManagedRelay::new(config, self.connect_timeout));
                self.relays.len() - 1
            }
        };
        &mut self.relays[idx]
    }

    pub fn get(&self, config: &RelayConfig) -> Option<&ManagedRelay> {
        self.position(config).map(|idx| &self.relays[idx])
    }

    fn position(&self, config: &RelayConfig) -> Option<usize> {
        self.relays.iter().position(|r| r.engine.config() == config)
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub async fn start_all(&mut self) -> Result<(), RelayError> {
        for relay in &mut self.relays {
            relay.launch().await?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for relay in &self.relays {
            relay.stop();
        }
    }

    pub fn status(&self) -> Vec<RelayStatus> {
        self.relays.iter().map(ManagedRelay::status).collect()
    }

    /// Relays whose worker has ended while nobody asked them to stop.
    pub fn failed(&self) -> Vec<RelayConfig> {
        self.relays
            .iter()
            .filter(|r| r.engine.state() == RelayState::Stopped && !r.engine.is_manual_stop())
            .map(|r| r.engine.config().clone())
            .collect()
    }

    /// Stop everything and collect each worker's exit.
    pub async fn shutdown(&mut self) -> Vec<(RelayConfig, RelayExit)> {
        self.stop_all();
        let mut exits = Vec::new();
        for relay in &mut self.relays {
            if let Some(exit) = relay.join().await {
                exits.push((relay.engine.config().clone(), exit));
            }
        }
        exits
    }
}
