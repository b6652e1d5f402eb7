//! Registry of connected clients, keyed by the domain they serve
//!
//! The registry is the sole owner of registrations: at most one live
//! control channel per domain. A second registration for a bound domain is
//! rejected; the existing connection wins. After every change a snapshot of
//! the current routes is broadcast so an external routing engine can
//! rebuild its tables.

use crate::channel::ControlChannel;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use url::Url;

/// Registration failures
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid credential for domain {0}")]
    Unauthorized(String),

    #[error("domain {0} is already registered on another connection")]
    DomainInUse(String),

    #[error("invalid upstream address: {0}")]
    InvalidUpstream(String),
}

/// One connected client: the domain it serves, where requests should be
/// forwarded, and the live control channel to reach it.
pub struct ClientRegistration {
    domain: String,
    upstream: Url,
    channel: Arc<ControlChannel>,
}

impl ClientRegistration {
    pub fn new(domain: String, upstream: Url, channel: Arc<ControlChannel>) -> Self {
        Self {
            domain,
            upstream,
            channel,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }
}

impl std::fmt::Display for ClientRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.domain, self.upstream)
    }
}

/// One route in a registry snapshot
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub domain: String,
    pub upstream: Url,
}

/// Snapshot of every registered route, sorted by domain
///
/// Published after each register/unregister. Receivers that lag simply skip
/// to a newer snapshot; only the latest state matters for routing.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub routes: Vec<RouteEntry>,
}

/// Registry of currently connected clients
pub struct ClientRegistry {
    clients: DashMap<String, Arc<ClientRegistration>>,
    events: broadcast::Sender<RegistrySnapshot>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            clients: DashMap::new(),
            events,
        }
    }

    /// Register a client for its domain
    ///
    /// Fails with `DomainInUse` if a live registration already exists: the
    /// first connection wins and the newcomer is rejected.
    pub fn register(
        &self,
        registration: ClientRegistration,
    ) -> Result<Arc<ClientRegistration>, RegisterError> {
        let registration = Arc::new(registration);
        match self.clients.entry(registration.domain().to_string()) {
            Entry::Occupied(_) => {
                return Err(RegisterError::DomainInUse(registration.domain().to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(registration.clone());
            }
        }

        debug!("registered {}", registration);
        self.publish();
        Ok(registration)
    }

    /// Remove the registration for `domain` if it still belongs to the
    /// channel identified by `channel_id`
    ///
    /// Idempotent. The identity check keeps a late unregister for a dead
    /// connection from evicting a newer registration of the same domain.
    pub fn unregister(&self, domain: &str, channel_id: u64) -> bool {
        let removed = self
            .clients
            .remove_if(domain, |_, reg| reg.channel().id() == channel_id)
            .is_some();

        if removed {
            debug!(domain, "unregistered");
            self.publish();
        }
        removed
    }

    /// Non-blocking lookup of the registration serving `domain`
    pub fn lookup(&self, domain: &str) -> Option<Arc<ClientRegistration>> {
        self.clients.get(domain).map(|entry| entry.value().clone())
    }

    /// All current registrations
    pub fn registrations(&self) -> Vec<Arc<ClientRegistration>> {
        self.clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Subscribe to registry change snapshots
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrySnapshot> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn publish(&self) {
        let mut routes: Vec<RouteEntry> = self
            .clients
            .iter()
            .map(|entry| RouteEntry {
                domain: entry.key().clone(),
                upstream: entry.value().upstream().clone(),
            })
            .collect();
        routes.sort_by(|a, b| a.domain.cmp(&b.domain));

        // No subscribers is fine; routing is an external concern.
        let _ = self.events.send(RegistrySnapshot { routes });
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registration(domain: &str, channel_id: u64) -> ClientRegistration {
        let (_client, server) = tokio::io::duplex(64);
        let (_read, write) = tokio::io::split(server);
        let channel = Arc::new(ControlChannel::new(channel_id, domain.to_string(), write));
        ClientRegistration::new(
            domain.to_string(),
            Url::parse("http://127.0.0.1:9000").unwrap(),
            channel,
        )
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = ClientRegistry::new();
        registry.register(test_registration("a.example", 1)).unwrap();

        let found = registry.lookup("a.example").unwrap();
        assert_eq!(found.domain(), "a.example");
        assert_eq!(found.upstream().as_str(), "http://127.0.0.1:9000/");

        assert!(registry.unregister("a.example", 1));
        assert!(registry.lookup("a.example").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_domain_rejected_first_wins() {
        let registry = ClientRegistry::new();
        registry.register(test_registration("a.example", 1)).unwrap();

        let result = registry.register(test_registration("a.example", 2));
        assert!(matches!(result, Err(RegisterError::DomainInUse(_))));

        // The original registration is untouched.
        let survivor = registry.lookup("a.example").unwrap();
        assert_eq!(survivor.channel().id(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_requires_matching_channel() {
        let registry = ClientRegistry::new();
        registry.register(test_registration("a.example", 1)).unwrap();

        // A stale unregister from another connection must not evict it.
        assert!(!registry.unregister("a.example", 99));
        assert!(registry.lookup("a.example").is_some());

        assert!(registry.unregister("a.example", 1));
        // Idempotent once gone.
        assert!(!registry.unregister("a.example", 1));
    }

    #[tokio::test]
    async fn test_reregister_after_unregister() {
        let registry = ClientRegistry::new();
        registry.register(test_registration("a.example", 1)).unwrap();
        registry.unregister("a.example", 1);

        let second = registry.register(test_registration("a.example", 2)).unwrap();
        assert_eq!(second.channel().id(), 2);
    }

    #[tokio::test]
    async fn test_snapshots_on_change() {
        let registry = ClientRegistry::new();
        let mut events = registry.subscribe();

        registry.register(test_registration("b.example", 1)).unwrap();
        registry.register(test_registration("a.example", 2)).unwrap();

        let snapshot = events.recv().await.unwrap();
        assert_eq!(snapshot.routes.len(), 1);
        assert_eq!(snapshot.routes[0].domain, "b.example");

        let snapshot = events.recv().await.unwrap();
        let domains: Vec<&str> = snapshot.routes.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["a.example", "b.example"]);

        registry.unregister("b.example", 1);
        let snapshot = events.recv().await.unwrap();
        assert_eq!(snapshot.routes.len(), 1);
        assert_eq!(snapshot.routes[0].domain, "a.example");
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_winner() {
        let registry = Arc::new(ClientRegistry::new());

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(test_registration("a.example", i)).is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
