//! # Relay Configuration
//!
//! Listener settings, loadable from a JSON file. Every field has a default, so
//! an empty object `{}` is a valid configuration.
//!
//! ```json
//! {
//!   "address": "127.0.0.1",
//!   "port": 1985,
//!   "start_on_init": true,
//!   "request_timeout_ms": 5000
//! }
//! ```

use crate::constants::{
    DEFAULT_ACCEPT_POLL, DEFAULT_LISTEN_ADDRESS, DEFAULT_LISTEN_PORT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SETTLE_TIMEOUT,
};
use crate::error::{RelayError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

fn default_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_start_on_init() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

fn default_settle_timeout_ms() -> u64 {
    DEFAULT_SETTLE_TIMEOUT.as_millis() as u64
}

fn default_accept_poll_ms() -> u64 {
    DEFAULT_ACCEPT_POLL.as_millis() as u64
}

/// Parses an IPv4 listen address, falling back to the default on bad input.
pub fn parse_listen_address(address: &str) -> (Ipv4Addr, bool) {
    match address.trim().parse::<Ipv4Addr>() {
        Ok(ip) => (ip, true),
        Err(_) => {
            warn!("Invalid listen address {address:?}, using {DEFAULT_LISTEN_ADDRESS}");
            (Ipv4Addr::UNSPECIFIED, false)
        }
    }
}

/// Settings for a relay listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// IPv4 literal to bind
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Start listening as soon as the relay is created
    #[serde(default = "default_start_on_init")]
    pub start_on_init: bool,
    /// Deadline for one request/response round trip
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for a new link to settle before discovery
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
    /// How often the acceptor wakes to check for a stop request
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            address: default_address(),
            port: default_port(),
            start_on_init: default_start_on_init(),
            request_timeout_ms: default_request_timeout_ms(),
            settle_timeout_ms: default_settle_timeout_ms(),
            accept_poll_ms: default_accept_poll_ms(),
        }
    }
}

impl RelayConfig {
    /// Reads a JSON configuration file. A malformed address is replaced by the
    /// default rather than rejected.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let mut config: RelayConfig = serde_json::from_str(&json)?;
        let address = config.address.clone();
        config.check_and_set_address(&address);
        config.validate()?;
        Ok(config)
    }

    /// Stores `address` if it is a valid IPv4 literal, otherwise the default.
    /// Returns whether the given address was accepted.
    pub fn check_and_set_address(&mut self, address: &str) -> bool {
        let (ip, accepted) = parse_listen_address(address);
        self.address = ip.to_string();
        accepted
    }

    /// Rejects settings the listener cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(RelayError::config("request_timeout_ms must be nonzero"));
        }
        if self.settle_timeout_ms == 0 {
            return Err(RelayError::config("settle_timeout_ms must be nonzero"));
        }
        if self.accept_poll_ms == 0 {
            return Err(RelayError::config("accept_poll_ms must be nonzero"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }
}
