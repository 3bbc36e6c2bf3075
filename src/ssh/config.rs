//! SSH Server Configuration
//!
//! The tunnel always talks to one fixed server. Values here are resolved once
//! at startup and passed into the session controller.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "we3d.com.cn";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "tunneluser";
pub const DEFAULT_KEY_PATH: &str = "~/.ssh/tunnel_key";

/// Ports the server allows us to bind for reverse forwards
pub const REMOTE_PORT_MIN: u16 = 12000;
pub const REMOTE_PORT_MAX: u16 = 13000;

/// Fixed SSH server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Private key file, already expanded
    pub key_path: PathBuf,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transport-level keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the transport gives up
    #[serde(default = "default_keepalive_max")]
    pub keepalive_count_max: usize,

    /// Lowest remote port the server accepts
    #[serde(default = "default_remote_min")]
    pub remote_port_min: u16,

    /// Highest remote port the server accepts
    #[serde(default = "default_remote_max")]
    pub remote_port_max: u16,

    /// Pinned SHA-256 host key fingerprint ("SHA256:...").
    /// When unset any host key is accepted and logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    60
}

fn default_keepalive_max() -> usize {
    3
}

fn default_remote_min() -> u16 {
    REMOTE_PORT_MIN
}

fn default_remote_max() -> u16 {
    REMOTE_PORT_MAX
}

impl ServerConfig {
    /// Built-in server settings with the key path expanded against `home`
    pub fn with_home(home: Option<&Path>) -> Self {
        Self {
            key_path: expand_home(DEFAULT_KEY_PATH, home),
            ..Self::default()
        }
    }

    /// Override the private key location
    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = key_path.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn remote_port_range(&self) -> RangeInclusive<u16> {
        self.remote_port_min..=self.remote_port_max
    }

    /// "user@host:port" for log lines
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: DEFAULT_USER.to_string(),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_max(),
            remote_port_min: REMOTE_PORT_MIN,
            remote_port_max: REMOTE_PORT_MAX,
            host_key_fingerprint: None,
        }
    }
}

/// Replace a leading `~` with `home`. Paths without `~`, or with no home
/// directory available, are returned unchanged.
pub fn expand_home(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) => {
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                home.to_path_buf()
            } else {
                home.join(rest)
            }
        }
        _ => PathBuf::from(path),
    }
}
