use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::NodeAddr;
use crate::error::Result;

pub async fn bind(addr: &NodeAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
    tracing::info!(addr = %addr, "Listening for peers");
    Ok(listener)
}

/// Accept connections until `shutdown` fires, handling each one on its own
/// task.
pub async fn serve<H, Fut>(listener: TcpListener, handler: H, shutdown: CancellationToken)
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(stream, remote).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}
