//! Channel configuration.
//!
//! A [`ChannelConfig`] is an ordinary serde structure. Every field has a
//! default, so a configuration file only lists what it changes:
//!
//! ```json
//! { "name": "acquirer", "remote_address": "10.0.0.7:5000", "send_max_request_size": 8192 }
//! ```
use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn matches(&self, address: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => address.is_ipv4(),
            AddressFamily::Ipv6 => address.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    /// Address a listener binds to.
    pub local_address: Option<String>,
    /// `host:port` to connect to, or the name of a listener registered in the
    /// local directory.
    pub remote_address: Option<String>,
    pub family: AddressFamily,
    /// Largest single write handed to the transport.
    pub send_max_request_size: usize,
    pub negotiation_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub check_certificate_revocation: bool,
    pub require_client_certificate: bool,
    /// TTL of received messages in the channel's context; absent means infinite.
    pub receive_ttl_ms: Option<u64>,
    pub max_frame_size: usize,
    pub accept_poll_interval_ms: u64,
    pub linger_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::from("channel"),
            local_address: None,
            remote_address: None,
            family: AddressFamily::Any,
            send_max_request_size: 4096,
            negotiation_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            check_certificate_revocation: false,
            require_client_certificate: false,
            receive_ttl_ms: None,
            max_frame_size: 16 * 1024 * 1024,
            accept_poll_interval_ms: 50,
            linger_secs: 10,
        }
    }
}

impl ChannelConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.send_max_request_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "send_max_request_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "negotiation_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.accept_poll_interval_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "accept_poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(local) = &self.local_address {
            self.resolve(local, true)?;
        }
        if let Some(remote) = &self.remote_address {
            if let Some((_, port)) = remote.rsplit_once(':') {
                match port.parse::<u16>() {
                    Ok(0) | Err(_) => return Err(ConfigurationError::InvalidPort(remote.clone())),
                    Ok(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Resolves `address` to the first socket address of the configured
    /// family. Port zero is only accepted for local (listening) addresses.
    pub fn resolve(&self, address: &str, local: bool) -> Result<SocketAddr, ConfigurationError> {
        let resolved = address
            .to_socket_addrs()
            .map_err(|_| ConfigurationError::InvalidAddress(address.to_string()))?
            .find(|candidate| self.family.matches(candidate))
            .ok_or_else(|| ConfigurationError::InvalidAddress(address.to_string()))?;

        if !local && resolved.port() == 0 {
            return Err(ConfigurationError::InvalidPort(address.to_string()));
        }
        Ok(resolved)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn receive_ttl(&self) -> Option<Duration> {
        self.receive_ttl_ms.map(Duration::from_millis)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }
}
