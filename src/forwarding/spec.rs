//! Tunnel specification

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::ssh::SshError;

/// Address the server binds the forwarded port on
pub const REMOTE_BIND_ADDRESS: &str = "127.0.0.1";

/// Host the bridge dials for every forwarded connection
pub const LOCAL_TARGET_HOST: &str = "127.0.0.1";

/// Which remote port forwards to which local port.
/// Immutable for the lifetime of one listener run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelSpec {
    local_port: u16,
    remote_port: u16,
}

impl TunnelSpec {
    /// Validate both ports. Local ports may be anything from 1 to 65535,
    /// remote ports must fall inside the range the server allows.
    pub fn new(
        local_port: u16,
        remote_port: u16,
        remote_range: &RangeInclusive<u16>,
    ) -> Result<Self, SshError> {
        if local_port == 0 {
            return Err(SshError::InvalidTunnel(
                "local port must be between 1 and 65535".to_string(),
            ));
        }
        if !remote_range.contains(&remote_port) {
            return Err(SshError::InvalidTunnel(format!(
                "remote port {} outside allowed range {}-{}",
                remote_port,
                remote_range.start(),
                remote_range.end()
            )));
        }
        Ok(Self {
            local_port,
            remote_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Same spec with the port the server actually bound
    pub(crate) fn with_bound_port(self, remote_port: u16) -> Self {
        Self {
            remote_port,
            ..self
        }
    }
}

impl std::fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "remote:{} -> local:{}",
            self.remote_port, self.local_port
        )
    }
}
