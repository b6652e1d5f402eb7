//! Relay configuration

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Credentials accepted at registration
///
/// A per-domain key takes precedence over the default key; a domain with
/// neither configured registers without a credential.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    per_domain: HashMap<String, String>,
    default: Option<String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` for registrations of `domain`
    pub fn with_domain_key(mut self, domain: impl Into<String>, key: impl Into<String>) -> Self {
        self.per_domain.insert(domain.into(), key.into());
        self
    }

    /// Require `key` for every domain without its own entry
    pub fn with_default_key(mut self, key: impl Into<String>) -> Self {
        self.default = Some(key.into());
        self
    }

    /// Check a presented credential against the configured one
    pub fn verify(&self, domain: &str, presented: Option<&str>) -> bool {
        match self
            .per_domain
            .get(domain)
            .map(String::as_str)
            .or(self.default.as_deref())
        {
            None => true,
            Some(expected) => presented == Some(expected),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where clients connect their control channels
    pub control_addr: SocketAddr,
    /// The public endpoint: ordinary traffic and reverse data legs
    pub public_addr: SocketAddr,
    /// Registration credentials
    pub credentials: Credentials,
    /// Default deadline for a pending reverse connection
    pub dial_timeout: Duration,
    /// Per-domain deadline overrides
    pub domain_dial_timeouts: HashMap<String, Duration>,
    /// How long a registration handshake may take
    pub handshake_timeout: Duration,
    /// How long the demultiplexer waits for a full preamble
    pub probe_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:0".parse().unwrap(),
            public_addr: "0.0.0.0:0".parse().unwrap(),
            credentials: Credentials::default(),
            dial_timeout: crate::broker::DEFAULT_DIAL_TIMEOUT,
            domain_dial_timeouts: HashMap::new(),
            handshake_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}
