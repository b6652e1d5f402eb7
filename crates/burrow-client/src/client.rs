//! Control-channel client and tunnel binder read loop

use crate::config::ClientConfig;
use crate::tunnel;
use crate::ClientError;
use burrow_proto::{read_message, write_message, ControlMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A tunnel client: registers a domain with the relay and serves reverse
/// connections for it until the channel closes.
pub struct TunnelClient {
    config: ClientConfig,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run one control-channel lifetime
    ///
    /// Connects, registers, then serves open-tunnel commands until the
    /// relay closes the channel, the link fails, or `shutdown` fires.
    /// Returns an error describing why the channel ended; reconnect policy
    /// belongs to the caller.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut control = TcpStream::connect(&self.config.control_addr).await?;

        write_message(
            &mut control,
            &ControlMessage::Register {
                domain: self.config.domain.clone(),
                upstream: self.config.upstream.to_string(),
                credential: self.config.credential.clone(),
            },
        )
        .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut control))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;

        match reply {
            Some(ControlMessage::Registered { domain }) => {
                info!(%domain, upstream = %self.config.upstream, "registered with relay");
            }
            Some(ControlMessage::Goodbye { reason }) => {
                return Err(ClientError::Rejected(reason));
            }
            Some(other) => {
                return Err(ClientError::Protocol(format!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
            None => return Err(ClientError::ChannelClosed),
        }

        // Tunnels spawned off this channel die with it.
        let tunnels = shutdown.child_token();
        let _tunnel_guard = tunnels.clone().drop_guard();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(domain = %self.config.domain, "shutting down control channel");
                    return Ok(());
                }
                msg = read_message(&mut control) => match msg {
                    Ok(Some(ControlMessage::OpenTunnel { id })) => {
                        debug!(id, "relay requested a reverse connection");
                        // Establishment runs in its own task; the read loop
                        // must stay free to receive the next id.
                        tokio::spawn(tunnel::run_tunnel(
                            id,
                            self.config.public_addr.clone(),
                            self.config.upstream_authority(),
                            tunnels.child_token(),
                        ));
                    }
                    Ok(Some(ControlMessage::Goodbye { reason })) => {
                        warn!(domain = %self.config.domain, "relay closed the channel: {}", reason);
                        return Err(ClientError::ClosedByRelay(reason));
                    }
                    Ok(Some(other)) => {
                        debug!("ignoring unexpected control message: {:?}", other);
                    }
                    Ok(None) => return Err(ClientError::ChannelClosed),
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }
}
