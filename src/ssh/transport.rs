//! SSH library seam
//!
//! The tunnel engine never touches russh directly. It drives these traits,
//! which the russh client implements for production and the test doubles
//! implement with resource tracking.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::config::ServerConfig;
use super::error::SshError;

/// Result of a non-blocking read on a forwarded channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer
    Data(usize),
    /// Nothing available right now
    Pending,
    /// Peer sent EOF or closed the channel
    Eof,
}

/// Creates authenticated sessions
#[async_trait]
pub trait SshBackend: Send + Sync + 'static {
    /// Parsed private key material
    type Key: Send + Sync + 'static;
    /// Connected but not yet authenticated transport
    type Pending: Send + 'static;
    /// Authenticated session
    type Transport: SshTransport;

    /// Parse the private key at `path`
    fn load_key(&self, path: &Path) -> Result<Self::Key, SshError>;

    /// Open the transport and complete the handshake
    async fn connect(&self, server: &ServerConfig) -> Result<Self::Pending, SshError>;

    /// Public-key authentication. The pending transport is released on failure.
    async fn authenticate(
        &self,
        pending: Self::Pending,
        username: &str,
        key: &Self::Key,
    ) -> Result<Self::Transport, SshError>;
}

/// An authenticated session
#[async_trait]
pub trait SshTransport: Send + Sync + 'static {
    type Channel: ForwardedChannel;

    /// Whether the underlying connection still reports itself live
    fn is_alive(&self) -> bool;

    /// Send a keepalive request and wait for the reply
    async fn send_keepalive(&self) -> Result<(), SshError>;

    /// Ask the server to listen on `address:port`. Returns the bound port.
    async fn request_remote_forward(&self, address: &str, port: u16) -> Result<u16, SshError>;

    /// Wait up to `timeout` for the next forwarded channel.
    /// `Ok(None)` means the wait timed out.
    async fn accept_forward(&self, timeout: Duration) -> Result<Option<Self::Channel>, SshError>;

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), SshError>;

    /// Close the session. Idempotent.
    async fn disconnect(&self);
}

/// One inbound connection delivered through the remote forward
#[async_trait]
pub trait ForwardedChannel: Send + 'static {
    fn is_open(&self) -> bool;

    fn is_eof(&self) -> bool;

    /// Copy whatever is already buffered into `buf` without waiting
    fn try_read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SshError>;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), SshError>;

    async fn send_eof(&mut self) -> Result<(), SshError>;

    /// Close and release the channel. Idempotent.
    async fn close(&mut self);
}
