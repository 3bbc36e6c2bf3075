//! SSH Error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("SSH key not found: {}", .0.display())]
    KeyNotFound(PathBuf),

    #[error("Failed to load SSH key: {}: {}", .path.display(), .reason)]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("Connection failed: {0}")]
    TransportConnectFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Failed to request port forward: {0}")]
    ForwardRequestFailed(String),

    #[error("Failed to connect to local port {port}: {reason}")]
    LocalDialFailed { port: u16, reason: String },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Invalid tunnel: {0}")]
    InvalidTunnel(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),
}

/// Coarse grouping used when reporting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Key file missing or unparsable
    Configuration,
    /// Network or handshake failure
    Transport,
    /// Server rejected the credentials
    Authentication,
    /// Remote forward could not be registered
    Forwarding,
    /// A single bridged connection failed
    Connection,
}

impl SshError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SshError::KeyNotFound(_) | SshError::KeyLoadFailed { .. } => {
                ErrorCategory::Configuration
            }
            SshError::AuthenticationFailed(_) => ErrorCategory::Authentication,
            SshError::ForwardRequestFailed(_) | SshError::InvalidTunnel(_) => {
                ErrorCategory::Forwarding
            }
            SshError::LocalDialFailed { .. } | SshError::ChannelError(_) => {
                ErrorCategory::Connection
            }
            SshError::TransportConnectFailed(_)
            | SshError::Timeout(_)
            | SshError::NotConnected
            | SshError::Disconnected
            | SshError::IoError(_)
            | SshError::ProtocolError(_) => ErrorCategory::Transport,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_not_found_mentions_path() {
        let err = SshError::KeyNotFound(PathBuf::from("/home/u/.ssh/tunnel_key"));
        assert!(err.to_string().contains("/home/u/.ssh/tunnel_key"));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            SshError::AuthenticationFailed("denied".into()).category(),
            ErrorCategory::Authentication
        );
        assert_eq!(
            SshError::LocalDialFailed {
                port: 80,
                reason: "refused".into()
            }
            .category(),
            ErrorCategory::Connection
        );
        assert_eq!(SshError::Disconnected.category(), ErrorCategory::Transport);
    }
}
