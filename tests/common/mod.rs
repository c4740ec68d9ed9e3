// tests/common/mod.rs
#![allow(dead_code)]

use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tcp_relay::{RelayEngine, RelayError, RelayState};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

/// Echo server; counts every accepted connection (probe included).
pub async fn echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    (addr, accepted)
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    closed_ports(1)[0]
}

/// `n` distinct ports nothing listens on.
pub fn closed_ports(n: usize) -> Vec<u16> {
    let held: Vec<StdTcpListener> = (0..n)
        .map(|_| StdTcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    held.iter().map(|l| l.local_addr().unwrap().port()).collect()
}

/// A remote whose accept queue is full, so new connects hang in SYN-SENT.
pub struct StalledRemote {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

pub async fn stalled_remote() -> StalledRemote {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut queued = Vec::new();
    for _ in 0..32 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            _ => break,
        }
    }
    StalledRemote {
        addr,
        _listener: listener,
        _queued: queued,
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let res = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for {what}");
}

/// Spawn `start()` and wait until the relay serves; returns the loopback address to dial.
pub async fn start_engine(
    engine: &Arc<RelayEngine>,
) -> (JoinHandle<Result<(), RelayError>>, SocketAddr) {
    let worker = {
        let engine = Arc::clone(engine);
        tokio::spawn(async move { engine.start().await })
    };
    wait_until("relay to run", || engine.state() == RelayState::Running).await;
    let port = engine.local_addr().expect("listener address").port();
    (worker, SocketAddr::from(([127, 0, 0, 1], port)))
}

pub async fn join_worker(worker: JoinHandle<Result<(), RelayError>>) -> Result<(), RelayError> {
    within(worker).await.expect("worker panicked")
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut).await.expect("operation timed out")
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    within(TcpStream::connect(addr)).await.expect("connect to relay")
}

/// Deterministic irregular chunk sizes in `1..=max`.
pub fn chunk_sizes(total: usize, max: usize, seed: u64) -> Vec<usize> {
    let mut state = seed;
    let mut left = total;
    let mut out = Vec::new();
    while left > 0 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let n = ((state >> 33) as usize % max + 1).min(left);
        out.push(n);
        left -= n;
    }
    out
}

pub fn payload(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
}
