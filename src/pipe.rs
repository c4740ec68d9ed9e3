// src/pipe.rs
// One direction of a relayed connection

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PIPE_BUFFER_SIZE: usize = 8 * 1024;

/// Copy `source` into `dest` until end-of-stream, then half-close `dest`.
///
/// Every chunk is flushed before the next read and reported to `on_chunk`.
/// Both ends are consumed and dropped on return, whatever the outcome; for a
/// split `TcpStream` that releases this direction's halves only, so the
/// opposite direction keeps draining after a half-close.
pub async fn pipe<R, W, F>(mut source: R, mut dest: W, mut on_chunk: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            dest.shutdown().await?;
            return Ok(total);
        }
        dest.write_all(&buf[..n]).await?;
        dest.flush().await?;
        total += n as u64;
        on_chunk(n as u64);
    }
}
