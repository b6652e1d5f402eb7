//! Inbound connection demultiplexer
//!
//! Sits in front of the public listener. Every accepted connection is
//! probed for a 4-byte tunnel-id preamble without consuming anything; a
//! match in the correlation table claims the connection as the data leg of
//! a pending dial, everything else is handed to the fallback handler with
//! its byte stream intact.

use crate::pending::PendingTunnels;
use async_trait::async_trait;
use burrow_proto::{decode_tunnel_id, TUNNEL_PREAMBLE_LEN};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// How long to wait between probe attempts when the preamble has only
/// partially arrived.
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A claimed reverse connection: the data leg of one tunnel
///
/// The 4-byte preamble has already been consumed; what remains is raw
/// tunnel payload in both directions. Teardown is always an abort (RST),
/// never a graceful close, so a peer blocked mid-read is released instead
/// of deadlocking against a half-closed pipe.
pub struct ReverseStream {
    inner: TcpStream,
}

impl ReverseStream {
    pub(crate) fn new(inner: TcpStream) -> Self {
        Self { inner }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Tear the connection down immediately
    ///
    /// Dropping the stream has the same effect; this spells it out at call
    /// sites that discard a stream mid-protocol.
    pub fn abort(self) {}
}

impl Drop for ReverseStream {
    fn drop(&mut self) {
        // Linger zero turns the close into a hard reset.
        let _ = self.inner.set_linger(Some(Duration::from_secs(0)));
    }
}

impl AsyncRead for ReverseStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReverseStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for ReverseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseStream")
            .field("peer_addr", &self.inner.peer_addr().ok())
            .finish()
    }
}

/// Handler for public connections that are not reverse-connection data legs
///
/// This is the seam to the external HTTP engine: ordinary requests flow
/// through here untouched, with no probed bytes consumed.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr);
}

/// Default fallback: answer every connection with 502 and hang up
///
/// Stands in for the out-of-scope HTTP engine so an unrouted public port
/// still behaves like "destination unavailable".
pub struct BadGatewayFallback;

#[async_trait]
impl FallbackHandler for BadGatewayFallback {
    async fn handle(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        debug!(%peer_addr, "no tunnel matched, answering 502");
        let response = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 16\r\n\r\nTunnel not found\n";
        let _ = stream.write_all(response).await;
        let _ = stream.shutdown().await;
    }
}

/// Demultiplexer for the public listener
pub struct Demultiplexer {
    pending: Arc<PendingTunnels>,
    fallback: Arc<dyn FallbackHandler>,
    probe_timeout: Duration,
}

impl Demultiplexer {
    pub fn new(
        pending: Arc<PendingTunnels>,
        fallback: Arc<dyn FallbackHandler>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            pending,
            fallback,
            probe_timeout,
        }
    }

    /// Route one freshly accepted public connection
    ///
    /// A connection carrying the id of a pending tunnel is claimed: the
    /// preamble is consumed and the rest of the stream fulfils the waiting
    /// dial. Anything else, including stale or replayed ids, goes to the
    /// fallback handler without losing a byte.
    pub async fn handle(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let id = match tokio::time::timeout(self.probe_timeout, peek_tunnel_id(&mut stream)).await
        {
            Ok(Ok(Some(id))) => id,
            Ok(Ok(None)) | Err(_) => {
                // Too short or too slow to be a data leg.
                self.fallback.handle(stream, peer_addr).await;
                return;
            }
            Ok(Err(e)) => {
                debug!(%peer_addr, "probe failed: {}", e);
                return;
            }
        };

        let Some(tx) = self.pending.claim(id) else {
            trace!(id, %peer_addr, "no pending tunnel for id, passing through");
            self.fallback.handle(stream, peer_addr).await;
            return;
        };

        // Now that the entry is ours, consume exactly the preamble.
        let mut preamble = [0u8; TUNNEL_PREAMBLE_LEN];
        if let Err(e) = stream.read_exact(&mut preamble).await {
            debug!(id, %peer_addr, "reverse connection died during claim: {}", e);
            return;
        }

        debug!(id, %peer_addr, "claimed reverse connection");
        if let Err(stream) = tx.send(ReverseStream::new(stream)) {
            // The dial gave up between our claim and the hand-off.
            trace!(id, "dial abandoned, aborting late data leg");
            stream.abort();
        }
    }
}

/// Peek at the first 4 bytes without consuming them
///
/// Returns `None` if the peer closed before sending a full preamble. Loops
/// on partial data so a trickling sender is not misclassified; the caller
/// bounds the wait with a timeout.
async fn peek_tunnel_id(stream: &mut TcpStream) -> std::io::Result<Option<u32>> {
    let mut buf = [0u8; TUNNEL_PREAMBLE_LEN];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n >= TUNNEL_PREAMBLE_LEN {
            return Ok(Some(decode_tunnel_id(buf)));
        }
        if n == 0 {
            return Ok(None);
        }
        tokio::time::sleep(PROBE_POLL_INTERVAL).await;
    }
}
