// SPDX-License-Identifier: AGPL-3.0-or-later
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on every wait of a tunneled request and of an agent poll.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);
pub const CERT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The relay's own host; tunneled hosts are `<subdomain>.<host>`.
    pub host: String,
    pub http_addr: SocketAddr,
    /// Required when a certificate provider is configured.
    pub https_addr: Option<SocketAddr>,
    pub timeout: Duration,
    /// Cap on buffered response-post bodies; unlimited when unset. Public
    /// request bodies are streamed and never capped.
    pub max_body_bytes: Option<usize>,
    /// Directory of the blob store; in-memory when unset.
    pub store_path: Option<PathBuf>,
    pub cert_provider: String,
    pub dns_provider: String,
    pub stats_interval: Duration,
}

impl RelayConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            https_addr: None,
            timeout: DEFAULT_TIMEOUT,
            max_body_bytes: None,
            store_path: None,
            cert_provider: "none".to_string(),
            dns_provider: "none".to_string(),
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    /// Normalizes the host and rejects settings the relay cannot run with.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.host = normalize_host(&self.host);
        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let valid = self
            .host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
        if !valid || self.host.starts_with('.') || self.host.contains("..") {
            return Err(ConfigError::InvalidHost(self.host));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.cert_provider != "none" && self.https_addr.is_none() {
            return Err(ConfigError::MissingHttpsAddr(self.cert_provider));
        }
        Ok(self)
    }
}

/// Lowercases, drops a trailing dot and a `:port` suffix.
pub fn normalize_host(raw: &str) -> String {
    let mut host = raw.trim();
    if let Some((name, port)) = host.rsplit_once(':') {
        if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) {
            host = name;
        }
    }
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_are_normalized() {
        assert_eq!(normalize_host("Relay.Test"), "relay.test");
        assert_eq!(normalize_host("a.relay.test:8080"), "a.relay.test");
        assert_eq!(normalize_host("relay.test."), "relay.test");
        assert_eq!(normalize_host("::1"), "::1");
    }

    #[test]
    fn validation() {
        let ok = RelayConfig::new("Relay.Test:80").validate().unwrap();
        assert_eq!(ok.host, "relay.test");

        assert!(matches!(RelayConfig::new("").validate(), Err(ConfigError::EmptyHost)));
        assert!(matches!(
            RelayConfig::new("bad host").validate(),
            Err(ConfigError::InvalidHost(_))
        ));

        let mut c = RelayConfig::new("relay.test");
        c.timeout = Duration::ZERO;
        assert!(matches!(c.validate(), Err(ConfigError::ZeroTimeout)));

        let mut c = RelayConfig::new("relay.test");
        c.cert_provider = "self-signed".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::MissingHttpsAddr(_))));
    }
}
