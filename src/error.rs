// src/error.rs
// Error types shared by the prober, the engine and the config loader

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::engine::RelayState;

/// Failure to open an outbound connection to the remote endpoint.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {addr} timed out after {}ms", .timeout.as_millis())]
    Timeout { addr: String, timeout: Duration },

    #[error("remote {addr} is unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl ConnectError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout { .. })
    }

    pub fn addr(&self) -> &str {
        match self {
            ConnectError::Timeout { addr, .. } | ConnectError::Unreachable { addr, .. } => addr,
        }
    }
}

/// Terminal result of `RelayEngine::start`.
///
/// A manual stop is not an error: `start` returns `Ok(())` for it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is {0}, expected init (call clear() first)")]
    InvalidState(RelayState),

    #[error("relay accept loop is still active")]
    LoopActive,

    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("initial connection test failed: {0}")]
    Probe(Arc<ConnectError>),

    #[error("relay stopped due to critical error: {0}")]
    Critical(Arc<ConnectError>),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

impl RelayError {
    /// Errors that invalidate the listening socket (everything but misuse).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::InvalidState(_) | RelayError::LoopActive)
    }

    /// The remote-side cause, when the error came from a connectivity failure.
    pub fn connect_cause(&self) -> Option<&ConnectError> {
        match self {
            RelayError::Probe(cause) | RelayError::Critical(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

/// Invalid relay mapping or CLI/env configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid mapping {0:?}, expected LOCAL:HOST:PORT")]
    Malformed(String),

    #[error("invalid port {value:?} in mapping {mapping:?}")]
    Port { mapping: String, value: String },

    #[error("remote host is empty in mapping {0:?}")]
    EmptyHost(String),

    #[error("local port {0} is mapped more than once")]
    DuplicateLocalPort(u16),

    #[error("no relay mappings configured (use --map or RELAY_MAPS)")]
    NoMappings,

    #[error("failed to read env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}
