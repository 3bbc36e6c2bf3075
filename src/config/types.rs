//! Persisted configuration types
//!
//! The on-disk shape is shared with other front ends and must stay exactly:
//!
//! ```json
//! {
//!   "tunnel": { "local_port": 80, "remote_port": 12000, "enabled": false },
//!   "auto_reconnect": true,
//!   "reconnect_delay": 5.0,
//!   "max_reconnect_delay": 300.0
//! }
//! ```

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::forwarding::TunnelSpec;
use crate::session::ReconnectPolicy;
use crate::ssh::SshError;

pub const DEFAULT_LOCAL_PORT: u16 = 80;
pub const DEFAULT_REMOTE_PORT: u16 = 12000;
pub const DEFAULT_RECONNECT_DELAY: f64 = 5.0;
pub const DEFAULT_MAX_RECONNECT_DELAY: f64 = 300.0;

/// Backoff growth factor; not persisted
const RECONNECT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Start the tunnel automatically after connecting
    #[serde(default)]
    pub enabled: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_LOCAL_PORT,
            remote_port: DEFAULT_REMOTE_PORT,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: f64,
    /// Seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            auto_reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
        }
    }
}

impl AppConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay_secs: self.reconnect_delay,
            max_delay_secs: self.max_reconnect_delay,
            multiplier: RECONNECT_MULTIPLIER,
            enabled: self.auto_reconnect,
        }
    }

    /// Validate the stored ports against the server's remote range
    pub fn tunnel_spec(&self, remote_range: &RangeInclusive<u16>) -> Result<TunnelSpec, SshError> {
        TunnelSpec::new(self.tunnel.local_port, self.tunnel.remote_port, remote_range)
    }
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

fn default_remote_port() -> u16 {
    DEFAULT_REMOTE_PORT
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> f64 {
    DEFAULT_RECONNECT_DELAY
}

fn default_max_reconnect_delay() -> f64 {
    DEFAULT_MAX_RECONNECT_DELAY
}
