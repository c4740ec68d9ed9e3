// src/probe.rs
// Bounded-timeout outbound connects: the startup reachability probe and the
// per-connection dial both go through here

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::config::join_host_port;
use crate::error::ConnectError;

/// Upper bound for every outbound connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open a connection to `host:port`, giving up after `timeout`.
///
/// Resolution failures and refused connections both map to
/// [`ConnectError::Unreachable`].
pub async fn connect_remote(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let addr = join_host_port(host, port);
    bounded(addr, timeout, TcpStream::connect((host, port))).await
}

/// Check that the remote accepts connections; the probe socket is closed right away.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<(), ConnectError> {
    let stream = connect_remote(host, port, timeout).await?;
    debug!(
        remote = %join_host_port(host, port),
        local = ?stream.local_addr().ok(),
        "remote reachability check passed"
    );
    drop(stream);
    Ok(())
}

pub(crate) async fn bounded<T, F>(addr: String, timeout: Duration, fut: F) -> Result<T, ConnectError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(source)) => Err(ConnectError::Unreachable { addr, source }),
        Err(_) => Err(ConnectError::Timeout { addr, timeout }),
    }
}
