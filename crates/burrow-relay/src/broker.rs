//! Reverse connection broker
//!
//! The single operation the external HTTP engine consumes: `dial` turns a
//! domain into a live duplex stream by asking the registered client, over
//! its control channel, to open a reverse connection back to the relay.

use crate::demux::ReverseStream;
use crate::pending::PendingTunnels;
use crate::registry::ClientRegistry;
use scopeguard::defer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Dial failures, returned to the forwarding engine
#[derive(Debug, Error)]
pub enum DialError {
    #[error("no client registered for domain {0}")]
    NoSuchClient(String),

    #[error("timed out waiting for a reverse connection for domain {0}")]
    Timeout(String),

    #[error("control channel for domain {0} closed")]
    ChannelClosed(String),

    #[error("dial cancelled")]
    Cancelled,
}

/// Default deadline for a pending reverse connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Brokers reverse connections between pending dials and arriving data legs
pub struct TunnelBroker {
    registry: Arc<ClientRegistry>,
    pending: Arc<PendingTunnels>,
    default_timeout: Duration,
    domain_timeouts: HashMap<String, Duration>,
}

impl TunnelBroker {
    pub fn new(registry: Arc<ClientRegistry>, pending: Arc<PendingTunnels>) -> Self {
        Self {
            registry,
            pending,
            default_timeout: DEFAULT_DIAL_TIMEOUT,
            domain_timeouts: HashMap::new(),
        }
    }

    /// Override the default pending-connection deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Per-domain deadline overrides
    pub fn with_domain_timeouts(mut self, timeouts: HashMap<String, Duration>) -> Self {
        self.domain_timeouts = timeouts;
        self
    }

    fn timeout_for(&self, domain: &str) -> Duration {
        self.domain_timeouts
            .get(domain)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Open a duplex stream to the client serving `domain`
    ///
    /// Allocates a correlation id, parks a completion handle in the table
    /// before anything is sent, then asks the client's control channel for
    /// a reverse connection and waits for the demultiplexer to deliver it.
    /// The table entry is removed on every exit path, so a data leg that
    /// arrives after a timeout or cancellation finds nothing to claim and
    /// is quietly passed through elsewhere.
    ///
    /// Any number of dials may be in flight concurrently, for the same or
    /// different domains; each is isolated by its id.
    pub async fn dial(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<ReverseStream, DialError> {
        let registration = self
            .registry
            .lookup(domain)
            .ok_or_else(|| DialError::NoSuchClient(domain.to_string()))?;

        let (id, completion) = self.pending.insert();
        defer! {
            self.pending.remove(id);
        }

        if registration.channel().send_open_tunnel(id).await.is_err() {
            warn!(domain, id, "control channel closed before open-tunnel was sent");
            return Err(DialError::ChannelClosed(domain.to_string()));
        }

        debug!(domain, id, "awaiting reverse connection");
        tokio::select! {
            biased;

            result = completion => match result {
                Ok(stream) => {
                    debug!(domain, id, "reverse connection established");
                    Ok(stream)
                }
                // The entry was claimed or dropped without a hand-off; the
                // channel or the relay itself is going away.
                Err(_) => Err(DialError::ChannelClosed(domain.to_string())),
            },
            _ = registration.channel().closed() => {
                warn!(domain, id, "control channel closed while dial was pending");
                Err(DialError::ChannelClosed(domain.to_string()))
            }
            _ = cancel.cancelled() => Err(DialError::Cancelled),
            _ = tokio::time::sleep(self.timeout_for(domain)) => {
                warn!(domain, id, "reverse connection timed out");
                Err(DialError::Timeout(domain.to_string()))
            }
        }
    }

    /// Number of dials currently awaiting a data leg
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ControlChannel;
    use crate::registry::ClientRegistration;
    use url::Url;

    fn broker_fixture() -> (Arc<ClientRegistry>, Arc<PendingTunnels>, TunnelBroker) {
        let registry = Arc::new(ClientRegistry::new());
        let pending = Arc::new(PendingTunnels::new());
        let broker = TunnelBroker::new(registry.clone(), pending.clone())
            .with_timeout(Duration::from_millis(200));
        (registry, pending, broker)
    }

    /// Registers a fake client; the returned duplex end must be kept alive
    /// or control sends will fail with a broken pipe.
    fn register_client(
        registry: &ClientRegistry,
        domain: &str,
    ) -> (Arc<ControlChannel>, tokio::io::DuplexStream) {
        let (client_end, server) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(server);
        let channel = Arc::new(ControlChannel::new(1, domain.to_string(), write));
        registry
            .register(ClientRegistration::new(
                domain.to_string(),
                Url::parse("http://127.0.0.1:9000").unwrap(),
                channel.clone(),
            ))
            .unwrap();
        (channel, client_end)
    }

    #[tokio::test]
    async fn test_dial_unknown_domain() {
        let (_registry, pending, broker) = broker_fixture();
        let cancel = CancellationToken::new();

        let result = broker.dial("missing.example", &cancel).await;
        assert!(matches!(result, Err(DialError::NoSuchClient(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dial_times_out_without_data_leg() {
        let (registry, pending, broker) = broker_fixture();
        let (_channel, _client_end) = register_client(&registry, "a.example");
        let cancel = CancellationToken::new();

        let result = broker.dial("a.example", &cancel).await;
        assert!(matches!(result, Err(DialError::Timeout(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dial_fails_fast_when_channel_closes() {
        let (registry, pending, broker) = broker_fixture();
        let (channel, _client_end) = register_client(&registry, "a.example");
        let broker = Arc::new(broker);

        let dial = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                broker.dial("a.example", &cancel).await
            })
        };

        // Give the dial a moment to park, then drop the client.
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close("client went away").await;

        let result = tokio::time::timeout(Duration::from_millis(100), dial)
            .await
            .expect("dial should not hang")
            .unwrap();
        assert!(matches!(result, Err(DialError::ChannelClosed(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dial_cancelled() {
        let (registry, pending, broker) = broker_fixture();
        let (_channel, _client_end) = register_client(&registry, "a.example");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = broker.dial("a.example", &cancel).await;
        assert!(matches!(result, Err(DialError::Cancelled)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_dial_on_already_closed_channel() {
        let (registry, pending, broker) = broker_fixture();
        let (channel, _client_end) = register_client(&registry, "a.example");
        channel.close("gone").await;

        let cancel = CancellationToken::new();
        let result = broker.dial("a.example", &cancel).await;
        assert!(matches!(result, Err(DialError::ChannelClosed(_))));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_per_domain_timeout_override() {
        let (registry, _pending, broker) = broker_fixture();
        let (_channel, _client_end) = register_client(&registry, "slow.example");

        let broker = broker.with_domain_timeouts(HashMap::from([(
            "slow.example".to_string(),
            Duration::from_millis(20),
        )]));

        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let result = broker.dial("slow.example", &cancel).await;
        assert!(matches!(result, Err(DialError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(150));
    }
}
