//! Outbound connections. One request per connection: connect, write one
//! envelope, read at most one response, close.
//!
//! Every call is bounded by a timeout. Callers that only need best effort use
//! [`send_or_skip`], which turns any failure into "peer currently
//! unreachable".

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::NodeAddr;
use crate::error::{EventerError, Result};
use crate::protocol::{read_message, Message};

/// Length of the raw tokens read back from PING and SYNC requests.
pub const TOKEN_LEN: usize = 2;

async fn connect(addr: &NodeAddr) -> Result<TcpStream> {
    TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .map_err(|e| EventerError::PeerUnreachable(format!("{addr}: {e}")))
}

async fn bounded<T, F>(addr: &NodeAddr, limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| EventerError::Timeout(addr.to_string()))?
}

/// Send an encoded envelope and read the raw 2-byte token reply.
pub async fn request_token(
    addr: &NodeAddr,
    frame: &[u8],
    limit: Duration,
) -> Result<[u8; TOKEN_LEN]> {
    bounded(addr, limit, async {
        let mut stream = connect(addr).await?;
        stream.write_all(frame).await?;
        let mut token = [0u8; TOKEN_LEN];
        stream.read_exact(&mut token).await?;
        Ok(token)
    })
    .await
}

/// Send an encoded envelope and read one envelope back.
pub async fn request_message(addr: &NodeAddr, frame: &[u8], limit: Duration) -> Result<Message> {
    bounded(addr, limit, async {
        let mut stream = connect(addr).await?;
        stream.write_all(frame).await?;
        read_message(&mut stream).await
    })
    .await
}

/// Send an encoded envelope that expects no reply, then wait for the peer to
/// close the connection so successive deliveries are handled in order.
pub async fn deliver(addr: &NodeAddr, frame: &[u8], limit: Duration) -> Result<()> {
    bounded(addr, limit, async {
        let mut stream = connect(addr).await?;
        stream.write_all(frame).await?;
        stream.shutdown().await?;
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).await?;
        Ok(())
    })
    .await
}

/// Best-effort delivery. Returns whether the peer took the envelope.
pub async fn send_or_skip(addr: &NodeAddr, frame: &[u8], limit: Duration) -> bool {
    match deliver(addr, frame, limit).await {
        Ok(()) => true,
        Err(e) => {
            tracing::trace!(peer = %addr, error = %e, "Peer skipped");
            false
        }
    }
}
