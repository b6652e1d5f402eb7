//! Client configuration

use crate::ClientError;
use url::Url;

/// Configuration for a tunnel client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay control endpoint (host:port) for the persistent channel
    pub control_addr: String,
    /// Relay public endpoint (host:port) that reverse connections dial back to
    pub public_addr: String,
    /// Domain to register under
    pub domain: String,
    /// Local upstream requests are forwarded to
    pub upstream: Url,
    /// Optional registration credential
    pub credential: Option<String>,
}

impl ClientConfig {
    /// Build a configuration, validating the upstream URL
    ///
    /// The upstream must be an absolute URL with a host and a resolvable
    /// port (explicit, or implied by http/https).
    pub fn new(
        control_addr: impl Into<String>,
        public_addr: impl Into<String>,
        domain: impl Into<String>,
        upstream: &str,
    ) -> Result<Self, ClientError> {
        let upstream_url =
            Url::parse(upstream).map_err(|e| ClientError::InvalidUpstream(format!("{upstream}: {e}")))?;

        if upstream_url.host_str().is_none() {
            return Err(ClientError::InvalidUpstream(format!(
                "{upstream}: missing host"
            )));
        }
        if upstream_url.port_or_known_default().is_none() {
            return Err(ClientError::InvalidUpstream(format!(
                "{upstream}: missing port"
            )));
        }

        Ok(Self {
            control_addr: control_addr.into(),
            public_addr: public_addr.into(),
            domain: domain.into(),
            upstream: upstream_url,
            credential: None,
        })
    }

    /// Set the registration credential
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// The upstream as a dialable host:port
    pub(crate) fn upstream_authority(&self) -> String {
        // Both checked in `new`.
        let host = self.upstream.host_str().unwrap_or("localhost");
        let port = self.upstream.port_or_known_default().unwrap_or(80);
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_upstream() {
        let config = ClientConfig::new(
            "relay.example:4443",
            "relay.example:8080",
            "a.example",
            "http://127.0.0.1:9000",
        )
        .unwrap();
        assert_eq!(config.upstream_authority(), "127.0.0.1:9000");
    }

    #[test]
    fn test_scheme_default_port() {
        let config = ClientConfig::new(
            "relay.example:4443",
            "relay.example:8080",
            "a.example",
            "https://internal.example",
        )
        .unwrap();
        assert_eq!(config.upstream_authority(), "internal.example:443");
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let result = ClientConfig::new(
            "relay.example:4443",
            "relay.example:8080",
            "a.example",
            "not a url",
        );
        assert!(matches!(result, Err(ClientError::InvalidUpstream(_))));
    }
}
