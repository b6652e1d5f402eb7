//! Per-request tunnel: one reverse connection spliced against the upstream

use burrow_proto::encode_tunnel_id;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Open and drive one tunnel for the given id
///
/// Failures tear the tunnel down and are only logged; a broken tunnel is
/// replaced by a fresh dial one layer up, never repaired here.
pub(crate) async fn run_tunnel(
    id: u32,
    public_addr: String,
    upstream_addr: String,
    cancel: CancellationToken,
) {
    let (server_leg, upstream_leg) = match establish(id, &public_addr, &upstream_addr).await {
        Ok(legs) => legs,
        Err(e) => {
            warn!(id, "failed to establish tunnel: {}", e);
            return;
        }
    };

    splice(id, server_leg, upstream_leg, cancel).await;
}

/// Dial both legs: the relay's public endpoint (tagged with the tunnel id)
/// and the local upstream
async fn establish(
    id: u32,
    public_addr: &str,
    upstream_addr: &str,
) -> std::io::Result<(TcpStream, TcpStream)> {
    let mut server_leg = TcpStream::connect(public_addr).await?;
    // The preamble must be the first bytes on the wire so the relay's
    // demultiplexer can claim the connection.
    server_leg.write_all(&encode_tunnel_id(id)).await?;

    let upstream_leg = TcpStream::connect(upstream_addr).await?;
    Ok((server_leg, upstream_leg))
}

/// Copy bytes both ways until either direction ends, errors, or the owning
/// channel is torn down; then drop both legs
async fn splice(
    id: u32,
    mut server_leg: TcpStream,
    mut upstream_leg: TcpStream,
    cancel: CancellationToken,
) {
    debug!(id, "tunnel spliced");

    let (mut server_read, mut server_write) = server_leg.split();
    let (mut upstream_read, mut upstream_write) = upstream_leg.split();

    tokio::select! {
        result = tokio::io::copy(&mut server_read, &mut upstream_write) => match result {
            Ok(bytes) => debug!(id, bytes, "relay-to-upstream direction finished"),
            Err(e) => debug!(id, "tunnel failed: {}", e),
        },
        result = tokio::io::copy(&mut upstream_read, &mut server_write) => match result {
            Ok(bytes) => debug!(id, bytes, "upstream-to-relay direction finished"),
            Err(e) => debug!(id, "tunnel failed: {}", e),
        },
        _ = cancel.cancelled() => debug!(id, "tunnel cancelled"),
    }

    debug!(id, "tunnel closed");
}
