// src/handler.rs
// Per-connection work: dial the remote, run both pipe directions, clean up

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{Outcome, Shared};
use crate::pipe::pipe;
use crate::probe::connect_remote;

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToRemote,
    ToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ToRemote => "client->remote",
            Direction::ToClient => "remote->client",
        }
    }
}

/// Relay one accepted client until both directions are done.
///
/// A failed dial marks the whole engine fatal; anything that goes wrong after
/// that stays local to this connection.
pub(crate) async fn handle_connection(client: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let _active = shared.stats.connection_opened();
    let cfg = &shared.config;

    let remote = match connect_remote(&cfg.remote_host, cfg.remote_port, shared.connect_timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            shared.stats.connection_failed();
            warn!(relay = %cfg, %peer, "remote connect failed: {}", err);
            shared.mark_fatal(Outcome::ConnectivityFailure(Arc::new(err)));
            return;
        }
    };

    for (side, stream) in [("client", &client), ("remote", &remote)] {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(relay = %cfg, %peer, side, "failed to set TCP_NODELAY: {}", err);
        }
    }
    debug!(relay = %cfg, %peer, "connected to remote {}", cfg.remote_addr());

    let (client_rd, client_wr) = client.into_split();
    let (remote_rd, remote_wr) = remote.into_split();
    let teardown = CancellationToken::new();
    let stats = &shared.stats;

    let (up, down) = tokio::join!(
        run_direction(Direction::ToRemote, client_rd, remote_wr, &teardown, |n| stats.add_to_remote(n)),
        run_direction(Direction::ToClient, remote_rd, client_wr, &teardown, |n| stats.add_to_client(n)),
    );

    debug!(
        relay = %cfg,
        %peer,
        bytes_to_remote = ?up,
        bytes_to_client = ?down,
        "connection closed"
    );
}

/// Run one pipe; an I/O error on either side tears down the sibling as well.
async fn run_direction<R, W, F>(
    dir: Direction,
    source: R,
    dest: W,
    teardown: &CancellationToken,
    on_chunk: F,
) -> Option<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    tokio::select! {
        res = pipe(source, dest, on_chunk) => match res {
            Ok(n) => Some(n),
            Err(err) => {
                debug!(direction = dir.as_str(), "pipe aborted: {}", err);
                teardown.cancel();
                None
            }
        },
        _ = teardown.cancelled() => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::probe::CONNECT_TIMEOUT;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (outer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (inner, peer) = accepted.unwrap();
        (outer.unwrap(), inner, peer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_through_remote_and_counts_bytes() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = remote.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
        });

        let shared = Shared::new(RelayConfig::new(0, "127.0.0.1", remote_port), CONNECT_TIMEOUT);
        let (mut user, inner, peer) = client_pair().await;
        let task = tokio::spawn(handle_connection(inner, peer, Arc::clone(&shared)));

        user.write_all(b"ping over relay").await.unwrap();
        user.shutdown().await.unwrap();
        let mut got = Vec::new();
        user.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping over relay");

        task.await.unwrap();
        let snap = shared.stats.snapshot();
        assert_eq!(snap.bytes_to_remote, 15);
        assert_eq!(snap.bytes_to_client, 15);
        assert_eq!(snap.active, 0);
        assert!(!shared.is_fatal());
    }

    #[tokio::test]
    async fn failed_dial_marks_engine_fatal_and_closes_client() {
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = gone.local_addr().unwrap().port();
        drop(gone);

        let shared = Shared::new(RelayConfig::new(0, "127.0.0.1", port), CONNECT_TIMEOUT);
        let (mut user, inner, peer) = client_pair().await;
        handle_connection(inner, peer, Arc::clone(&shared)).await;

        assert!(shared.is_fatal());
        assert!(matches!(shared.outcome(), Outcome::ConnectivityFailure(_)));
        assert_eq!(shared.stats.snapshot().failed, 1);

        let mut buf = [0u8; 8];
        let n = user.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
