//! Relay configuration.

use std::net::IpAddr;
use std::time::Duration;

use relay_proto::DEFAULT_PRIVILEGED_KINDS;

/// Static relay settings. Constructed once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Canonical URL clients must name in auth events
    pub relay_url: String,
    /// Listen address for the WebSocket server
    pub bind_addr: String,
    /// Largest accepted inbound message, in bytes
    pub max_message_size: usize,
    /// Require authentication for every read and write
    pub auth_required: bool,
    /// Accept reads and writes from keys with no ACL entry
    pub public: bool,
    /// Public relay that still demands auth before serving reads
    pub public_auth_required: bool,
    /// Events created at or before this unix timestamp are rejected
    pub oldest_allowed: u64,
    /// Kinds whose visibility is restricted to author and recipients
    pub privileged_kinds: Vec<u16>,
    /// Remote addresses that bypass the privileged-filter party check
    pub allowed_ips: Vec<IpAddr>,
    /// Owner public keys, seeded into the ACL at startup
    pub owners: Vec<String>,
    /// Keep-alive ping interval
    pub ping_interval: Duration,
    /// Read deadline; missing a pong for this long tears the connection down
    pub pong_timeout: Duration,
    /// Per-frame write deadline
    pub write_timeout: Duration,
    /// How long a privileged filter request waits for authentication
    pub filter_auth_wait: Duration,
    /// How long a count request waits for authentication
    pub count_auth_wait: Duration,
    /// Malformed messages tolerated before the connection goes silent
    pub max_offenses: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            relay_url: "ws://localhost:3334".to_string(),
            bind_addr: "0.0.0.0:3334".to_string(),
            max_message_size: 512 * 1024,
            auth_required: false,
            public: true,
            public_auth_required: false,
            oldest_allowed: 0,
            privileged_kinds: DEFAULT_PRIVILEGED_KINDS.to_vec(),
            allowed_ips: Vec::new(),
            owners: Vec::new(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            filter_auth_wait: Duration::from_secs(5),
            count_auth_wait: Duration::from_secs(10),
            max_offenses: 16,
        }
    }
}

impl RelayConfig {
    /// Defaults with `RELAY_URL` and `RELAY_BIND` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(bind) = std::env::var("RELAY_BIND") {
            config.bind_addr = bind;
        }
        config
    }

    /// Whether policy demands auth before serving any request.
    pub fn auth_mandatory(&self) -> bool {
        self.auth_required || (self.public && self.public_auth_required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_open_relay() {
        let config = RelayConfig::default();
        assert!(!config.auth_mandatory());
        assert_eq!(config.max_offenses, 16);
        assert_eq!(config.privileged_kinds, vec![4, 13, 1059, 30078]);
    }

    #[test]
    fn public_auth_required_makes_auth_mandatory() {
        let config = RelayConfig {
            public_auth_required: true,
            ..Default::default()
        };
        assert!(config.auth_mandatory());
    }
}
