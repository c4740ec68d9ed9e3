// src/engine.rs
// Relay engine: listener ownership, accept loop and the INIT/RUNNING/STOPPED
// state machine with its fatal-error latch

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{ConnectError, RelayError};
use crate::handler::handle_connection;
use crate::probe::{probe, CONNECT_TIMEOUT};
use crate::stats::{RelayStats, StatsSnapshot};

/// Lifecycle phase of a relay, as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    Init,
    Running,
    Stopped,
}

impl RelayState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RelayState::Init,
            1 => RelayState::Running,
            _ => RelayState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RelayState::Init => 0,
            RelayState::Running => 1,
            RelayState::Stopped => 2,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayState::Init => "init",
            RelayState::Running => "running",
            RelayState::Stopped => "stopped",
        })
    }
}

/// What ended (or has not yet ended) the current run.
///
/// `Running` means nothing fatal has been latched.
#[derive(Debug, Clone)]
pub enum Outcome {
    Running,
    ManualStop,
    ConnectivityFailure(Arc<ConnectError>),
}

impl Outcome {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Outcome::Running)
    }
}

/// Close handle for the listener owned by the accept loop.
struct ListenerHandle {
    addr: SocketAddr,
    close: CancellationToken,
}

struct Latch {
    outcome: Outcome,
    listener: Option<ListenerHandle>,
}

/// State shared by the engine, its accept loop and every connection task.
pub(crate) struct Shared {
    pub(crate) config: RelayConfig,
    pub(crate) connect_timeout: Duration,
    pub(crate) stats: Arc<RelayStats>,
    state: AtomicU8,
    fatal: AtomicBool,
    manual_stop: AtomicBool,
    accept_loop: AtomicBool,
    latch: Mutex<Latch>,
}

impl Shared {
    pub(crate) fn new(config: RelayConfig, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            config,
            connect_timeout,
            stats: Arc::new(RelayStats::default()),
            state: AtomicU8::new(RelayState::Init.as_u8()),
            fatal: AtomicBool::new(false),
            manual_stop: AtomicBool::new(false),
            accept_loop: AtomicBool::new(false),
            latch: Mutex::new(Latch {
                outcome: Outcome::Running,
                listener: None,
            }),
        })
    }

    pub(crate) fn state(&self) -> RelayState {
        RelayState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RelayState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub(crate) fn outcome(&self) -> Outcome {
        self.latch.lock().outcome.clone()
    }

    /// Latch `cause` unless something fatal was latched already, and close the
    /// listener so a pending accept wakes up. Returns whether this call won.
    pub(crate) fn mark_fatal(&self, cause: Outcome) -> bool {
        if !cause.is_fatal() {
            return false;
        }
        let mut latch = self.latch.lock();
        if latch.outcome.is_fatal() {
            return false;
        }
        latch.outcome = cause;
        self.fatal.store(true, Ordering::Release);
        if let Some(listener) = latch.listener.take() {
            listener.close.cancel();
            debug!(relay = %self.config, addr = %listener.addr, "listener closed");
        }
        true
    }

    /// Drop the listener handle if the accept loop is leaving on its own.
    fn release_listener(&self) {
        self.latch.lock().listener = None;
    }
}

/// Per-run teardown for `start`, including when its future is dropped
/// mid-run: forget the listener, leave the engine `Stopped`, then free the
/// single-accept-loop flag.
struct RunGuard<'a>(&'a Shared);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let shared = self.0;
        shared.release_listener();
        shared.set_state(RelayState::Stopped);
        shared.accept_loop.store(false, Ordering::Release);
    }
}

/// A local port forwarder for one [`RelayConfig`].
///
/// Share it behind an `Arc`: `start` runs on a worker task while `stop`,
/// `state` and friends are called from anywhere.
pub struct RelayEngine {
    shared: Arc<Shared>,
}

impl RelayEngine {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self::from_config(RelayConfig::new(local_port, remote_host, remote_port))
    }

    pub fn from_config(config: RelayConfig) -> Self {
        Self::with_connect_timeout(config, CONNECT_TIMEOUT)
    }

    /// Like [`from_config`](Self::from_config) with a custom bound for outbound connects.
    pub fn with_connect_timeout(config: RelayConfig, connect_timeout: Duration) -> Self {
        Self {
            shared: Shared::new(config, connect_timeout),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn state(&self) -> RelayState {
        self.shared.state()
    }

    pub fn is_manual_stop(&self) -> bool {
        self.shared.manual_stop.load(Ordering::Acquire)
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.is_fatal()
    }

    pub fn outcome(&self) -> Outcome {
        self.shared.outcome()
    }

    /// The latched connectivity failure, if that is what ended the run.
    pub fn fatal_cause(&self) -> Option<Arc<ConnectError>> {
        match self.shared.outcome() {
            Outcome::ConnectivityFailure(cause) => Some(cause),
            _ => None,
        }
    }

    /// Bound listening address; `None` unless the listener is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.latch.lock().listener.as_ref().map(|l| l.addr)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Bind, probe the remote, then serve until stopped.
    ///
    /// Returns `Ok(())` after a manual stop. Every other exit is an error and
    /// leaves the engine `Stopped`; call [`clear`](Self::clear) before
    /// starting it again.
    pub async fn start(&self) -> Result<(), RelayError> {
        let shared = &self.shared;
        let state = shared.state();
        if state != RelayState::Init {
            return Err(RelayError::InvalidState(state));
        }
        if shared
            .accept_loop
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RelayError::LoopActive);
        }
        // declared before the listener so the socket is closed first on every exit
        let _guard = RunGuard(shared.as_ref());
        let cfg = &shared.config;

        let listener = match bind(cfg.local_port).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(relay = %cfg, "failed to bind: {}", source);
                return Err(RelayError::Bind {
                    port: cfg.local_port,
                    source,
                });
            }
        };
        let addr = listener.local_addr().map_err(|source| RelayError::Bind {
            port: cfg.local_port,
            source,
        })?;

        let close = CancellationToken::new();
        {
            let mut latch = shared.latch.lock();
            if !latch.outcome.is_fatal() {
                latch.listener = Some(ListenerHandle {
                    addr,
                    close: close.clone(),
                });
            } else {
                // stopped between the state check and the bind
                close.cancel();
            }
        }
        info!(relay = %cfg, %addr, "relay listening, forwarding to {}", cfg.remote_addr());

        let probed = tokio::select! {
            biased;
            _ = close.cancelled() => None,
            res = probe(&cfg.remote_host, cfg.remote_port, shared.connect_timeout) => Some(res),
        };
        match probed {
            None => {
                debug!(relay = %cfg, "stopped during the reachability check");
                drop(listener);
                return self.classify_exit(None);
            }
            Some(Err(err)) => {
                error!(relay = %cfg, "initial connection test failed: {}", err);
                let cause = Arc::new(err);
                shared.mark_fatal(Outcome::ConnectivityFailure(Arc::clone(&cause)));
                return Err(RelayError::Probe(cause));
            }
            Some(Ok(())) => {}
        }

        let promoted = shared
            .state
            .compare_exchange(
                RelayState::Init.as_u8(),
                RelayState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if promoted {
            info!(relay = %cfg, "relay running");
        }

        let accept_error = if promoted {
            accept_loop(shared, &listener, &close).await
        } else {
            None
        };

        drop(listener);
        shared.release_listener();
        shared.set_state(RelayState::Stopped);
        self.classify_exit(accept_error)
    }

    fn classify_exit(&self, accept_error: Option<io::Error>) -> Result<(), RelayError> {
        let cfg = &self.shared.config;
        let outcome = if self.is_manual_stop() {
            Outcome::ManualStop
        } else {
            self.shared.outcome()
        };

        match outcome {
            Outcome::ManualStop => {
                info!(relay = %cfg, "relay stopped manually");
                Ok(())
            }
            Outcome::ConnectivityFailure(cause) => {
                error!(relay = %cfg, "relay stopped due to critical error: {}", cause);
                Err(RelayError::Critical(cause))
            }
            Outcome::Running => {
                let err = accept_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "listener closed unexpectedly")
                });
                error!(relay = %cfg, "accept failed: {}", err);
                Err(RelayError::Accept(err))
            }
        }
    }

    /// Request termination. Safe from any thread, at any time, any number of times.
    pub fn stop(&self) {
        let shared = &self.shared;
        shared.manual_stop.store(true, Ordering::Release);
        if shared.mark_fatal(Outcome::ManualStop) {
            info!(relay = %shared.config, "stop requested");
        }
        shared.set_state(RelayState::Stopped);
    }

    /// Reset per-run bookkeeping so the engine can be started again.
    pub fn clear(&self) -> Result<(), RelayError> {
        let shared = &self.shared;
        let state = shared.state();
        if state == RelayState::Running {
            return Err(RelayError::InvalidState(state));
        }
        if shared.accept_loop.load(Ordering::Acquire) {
            return Err(RelayError::LoopActive);
        }

        let mut latch = shared.latch.lock();
        latch.outcome = Outcome::Running;
        latch.listener = None;
        shared.fatal.store(false, Ordering::Release);
        shared.manual_stop.store(false, Ordering::Release);
        shared.set_state(RelayState::Init);
        drop(latch);

        debug!(relay = %shared.config, "relay cleared");
        Ok(())
    }
}

impl fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEngine")
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .field("manual_stop", &self.is_manual_stop())
            .field("fatal", &self.is_fatal())
            .finish()
    }
}

/// Bind the wildcard address on `port`.
///
/// `[::]` is tried first; on a default Linux host it is dual-stack and takes
/// IPv4 clients too. Hosts without IPv6 fall back to `0.0.0.0`. A host with
/// `net.ipv6.bindv6only=1` serves IPv6 clients only.
async fn bind(port: u16) -> io::Result<TcpListener> {
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
        Ok(listener) => Ok(listener),
        Err(err) if matches!(err.kind(), io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied) => {
            Err(err)
        }
        Err(err) => {
            debug!(port, "IPv6 wildcard bind failed ({}), using IPv4 only", err);
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
        }
    }
}

/// Serve until the listener is closed or accept fails.
///
/// Returns the accept error when one ended the loop while nothing fatal was
/// latched; `None` when the close handle fired.
async fn accept_loop(
    shared: &Arc<Shared>,
    listener: &TcpListener,
    close: &CancellationToken,
) -> Option<io::Error> {
    while !shared.is_fatal() {
        tokio::select! {
            biased;
            _ = close.cancelled() => return None,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!(relay = %shared.config, %peer, "client connected");
                    tokio::spawn(handle_connection(stream, peer, Arc::clone(shared)));
                }
                Err(err) if shared.is_fatal() => {
                    debug!(relay = %shared.config, "accept interrupted by shutdown: {}", err);
                    return None;
                }
                Err(err) => {
                    warn!(relay = %shared.config, "accept error: {}", err);
                    return Some(err);
                }
            },
        }
    }
    None
}
