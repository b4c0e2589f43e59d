//! Bidirectional byte pump.
//!
//! Bytes are copied unmodified in both directions. The first direction to
//! finish, by EOF or by error, ends the relay and both sides are shut down;
//! anything still in flight the other way is dropped. There is no idle or
//! byte limit.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 8192;

/// Which socket ended the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes_to_target: u64,
    pub bytes_to_client: u64,
    /// Side whose read ended first.
    pub closed_by: Side,
    /// Transport error that ended the relay, if any.
    pub error: Option<io::Error>,
}

/// Relay between `client` and `target` until either side closes.
pub async fn relay<A, B>(client: A, target: B) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let mut bytes_to_target = 0u64;
    let mut bytes_to_client = 0u64;

    let (closed_by, result) = tokio::select! {
        result = pump(&mut client_read, &mut target_write, &mut bytes_to_target) => (Side::Client, result),
        result = pump(&mut target_read, &mut client_write, &mut bytes_to_client) => (Side::Target, result),
    };

    // Full close: both peers see EOF.
    let _ = target_write.shutdown().await;
    let _ = client_write.shutdown().await;

    RelayOutcome {
        bytes_to_target,
        bytes_to_client,
        closed_by,
        error: result.err(),
    }
}

/// Copy `reader` into `writer` until EOF, counting bytes written.
async fn pump<R, W>(reader: &mut R, writer: &mut W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *count += n as u64;
    }
}
