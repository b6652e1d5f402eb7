//! Relay server assembly
//!
//! Binds the control and public listeners and wires the registry,
//! correlation table, broker, and demultiplexer together. Everything is
//! owned and injected, so several relays can run side by side in one
//! process.

use crate::broker::TunnelBroker;
use crate::channel::ControlChannel;
use crate::config::RelayConfig;
use crate::demux::{BadGatewayFallback, Demultiplexer, FallbackHandler};
use crate::pending::PendingTunnels;
use crate::registry::{ClientRegistration, ClientRegistry, RegisterError};
use burrow_proto::{read_message, write_message, ControlMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },
}

/// The relay: accepts control channels on one port, and public traffic
/// (ordinary requests plus reverse data legs) on another.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
    broker: Arc<TunnelBroker>,
    demux: Arc<Demultiplexer>,
    control_listener: TcpListener,
    public_listener: TcpListener,
    control_addr: SocketAddr,
    public_addr: SocketAddr,
    next_channel_id: AtomicU64,
}

impl Relay {
    /// Bind both listeners with the default 502 fallback
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        Self::bind_with_fallback(config, Arc::new(BadGatewayFallback)).await
    }

    /// Bind both listeners, handing unmatched public connections to
    /// `fallback` (the seam for an external HTTP engine)
    pub async fn bind_with_fallback(
        config: RelayConfig,
        fallback: Arc<dyn FallbackHandler>,
    ) -> Result<Self, RelayError> {
        let control_listener = bind(config.control_addr).await?;
        let public_listener = bind(config.public_addr).await?;
        let control_addr = control_listener.local_addr()?;
        let public_addr = public_listener.local_addr()?;

        let registry = Arc::new(ClientRegistry::new());
        let pending = Arc::new(PendingTunnels::new());
        let broker = Arc::new(
            TunnelBroker::new(registry.clone(), pending.clone())
                .with_timeout(config.dial_timeout)
                .with_domain_timeouts(config.domain_dial_timeouts.clone()),
        );
        let demux = Arc::new(Demultiplexer::new(
            pending,
            fallback,
            config.probe_timeout,
        ));

        Ok(Self {
            config,
            registry,
            broker,
            demux,
            control_listener,
            public_listener,
            control_addr,
            public_addr,
            next_channel_id: AtomicU64::new(0),
        })
    }

    /// Address clients connect their control channels to
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The public endpoint
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// The dial interface consumed by the external HTTP engine
    pub fn broker(&self) -> Arc<TunnelBroker> {
        self.broker.clone()
    }

    /// The registry, for route-table subscriptions
    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` fires
    ///
    /// Shutdown propagates to every control connection: each channel is
    /// closed with a reason, which unwinds its in-flight dials and, on the
    /// client side, its tunnels.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        info!(
            control = %self.control_addr,
            public = %self.public_addr,
            "relay listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.control_listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "accepted control connection");
                        let registry = self.registry.clone();
                        let credentials = self.config.credentials.clone();
                        let handshake_timeout = self.config.handshake_timeout;
                        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            run_control_connection(
                                stream,
                                peer_addr,
                                channel_id,
                                registry,
                                credentials,
                                handshake_timeout,
                                shutdown,
                            )
                            .await;
                        });
                    }
                    Err(e) => error!("failed to accept control connection: {}", e),
                },
                accepted = self.public_listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let demux = self.demux.clone();
                        tokio::spawn(async move {
                            demux.handle(stream, peer_addr).await;
                        });
                    }
                    Err(e) => error!("failed to accept public connection: {}", e),
                },
            }
        }

        info!("relay shutting down");
        Ok(())
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr).await.map_err(|e| RelayError::BindError {
        address: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Drive one control connection from handshake to disconnect
async fn run_control_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    channel_id: u64,
    registry: Arc<ClientRegistry>,
    credentials: crate::config::Credentials,
    handshake_timeout: std::time::Duration,
    shutdown: CancellationToken,
) {
    let (mut read_half, write_half) = stream.into_split();

    let hello = match tokio::time::timeout(handshake_timeout, read_message(&mut read_half)).await {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => {
            debug!(%peer_addr, "control connection closed before handshake");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer_addr, "control handshake failed: {}", e);
            reject(write_half, "malformed registration").await;
            return;
        }
        Err(_) => {
            debug!(%peer_addr, "control handshake timed out");
            reject(write_half, "registration timed out").await;
            return;
        }
    };

    let ControlMessage::Register {
        domain,
        upstream,
        credential,
    } = hello
    else {
        debug!(%peer_addr, "first control message was not a registration");
        reject(write_half, "expected registration").await;
        return;
    };

    // Authentication and validation happen before any registry mutation;
    // a failed registration never leaves state behind.
    if !credentials.verify(&domain, credential.as_deref()) {
        warn!(%peer_addr, %domain, "registration with invalid credential");
        reject(
            write_half,
            &RegisterError::Unauthorized(domain.clone()).to_string(),
        )
        .await;
        return;
    }

    let upstream = match Url::parse(&upstream) {
        Ok(url) if url.host_str().is_some() => url,
        _ => {
            warn!(%peer_addr, %domain, %upstream, "registration with invalid upstream");
            reject(
                write_half,
                &RegisterError::InvalidUpstream(upstream).to_string(),
            )
            .await;
            return;
        }
    };

    let channel = Arc::new(ControlChannel::new(channel_id, domain.clone(), write_half));
    let registration = match registry.register(ClientRegistration::new(
        domain.clone(),
        upstream,
        channel.clone(),
    )) {
        Ok(registration) => registration,
        Err(e) => {
            warn!(%peer_addr, %domain, "registration rejected: {}", e);
            channel.close(&e.to_string()).await;
            return;
        }
    };

    if channel.send_registered().await.is_err() {
        debug!(%peer_addr, %domain, "client vanished before registration ack");
        registry.unregister(&domain, channel.id());
        return;
    }

    info!(%peer_addr, "client connected: {}", registration);

    tokio::select! {
        _ = channel.wait_closed(&mut read_half) => {}
        _ = shutdown.cancelled() => {
            channel.close("relay shutting down").await;
        }
    }

    registry.unregister(&domain, channel.id());
    info!(%peer_addr, "client disconnected: {}", registration);
}

/// Refuse a connection before a channel exists for it
async fn reject(mut write_half: OwnedWriteHalf, reason: &str) {
    let goodbye = ControlMessage::Goodbye {
        reason: reason.to_string(),
    };
    let _ = write_message(&mut write_half, &goodbye).await;
    let _ = write_half.shutdown().await;
}
