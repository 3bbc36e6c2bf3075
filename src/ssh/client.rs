//! SSH Client implementation using russh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Buf, BytesMut};
use futures_util::FutureExt;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use russh::*;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use super::transport::{ForwardedChannel, ReadOutcome, SshBackend, SshTransport};

/// Production backend over russh
#[derive(Debug, Clone, Default)]
pub struct RusshBackend;

impl RusshBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Connected, not yet authenticated
pub struct RusshPending {
    handle: client::Handle<ClientHandler>,
    forwarded_rx: mpsc::UnboundedReceiver<Channel<client::Msg>>,
}

#[async_trait]
impl SshBackend for RusshBackend {
    type Key = Arc<PrivateKey>;
    type Pending = RusshPending;
    type Transport = RusshTransport;

    fn load_key(&self, path: &Path) -> Result<Self::Key, SshError> {
        russh::keys::load_secret_key(path, None)
            .map(Arc::new)
            .map_err(|e| SshError::KeyLoadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn connect(&self, server: &ServerConfig) -> Result<Self::Pending, SshError> {
        info!("Connecting to {}", server.display_target());

        let ssh_config = client::Config {
            inactivity_timeout: None, // supervisor health checks handle liveness
            keepalive_interval: Some(server.keepalive_interval()),
            keepalive_max: server.keepalive_count_max,
            ..Default::default()
        };

        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler::new(
            server.host.clone(),
            server.port,
            server.host_key_fingerprint.clone(),
            forwarded_tx,
        );

        let handle = tokio::time::timeout(
            server.connect_timeout(),
            client::connect(
                Arc::new(ssh_config),
                (server.host.as_str(), server.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            SshError::TransportConnectFailed(format!(
                "Connection to {}:{} timed out after {}s",
                server.host, server.port, server.timeout_secs
            ))
        })?
        .map_err(connect_error)?;

        debug!("SSH handshake completed");

        Ok(RusshPending {
            handle,
            forwarded_rx,
        })
    }

    async fn authenticate(
        &self,
        pending: Self::Pending,
        username: &str,
        key: &Self::Key,
    ) -> Result<Self::Transport, SshError> {
        let RusshPending {
            mut handle,
            forwarded_rx,
        } = pending;

        // rsa-sha2-* when the server supports it, ignored for other key types
        let hash_alg = match handle.best_supported_rsa_hash().await {
            Ok(Some(alg)) => alg,
            _ => None,
        };
        let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);

        let outcome = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()));

        match outcome {
            Ok(result) if result.success() => {}
            Ok(_) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                return Err(SshError::AuthenticationFailed(
                    "Authentication rejected by server".to_string(),
                ));
            }
            Err(e) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                return Err(e);
            }
        }

        info!("SSH authentication successful");

        let session_id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, session_id.clone());

        Ok(RusshTransport {
            session_id,
            controller,
            forwarded_rx: Mutex::new(forwarded_rx),
        })
    }
}

/// Authenticated russh session
pub struct RusshTransport {
    session_id: String,
    controller: HandleController,
    forwarded_rx: Mutex<mpsc::UnboundedReceiver<Channel<client::Msg>>>,
}

impl RusshTransport {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    type Channel = RusshChannel;

    fn is_alive(&self) -> bool {
        self.controller.is_connected()
    }

    async fn send_keepalive(&self) -> Result<(), SshError> {
        match self.controller.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => Err(SshError::Timeout("Keepalive not answered".to_string())),
            PingResult::IoError => Err(SshError::Disconnected),
        }
    }

    async fn request_remote_forward(&self, address: &str, port: u16) -> Result<u16, SshError> {
        let bound = self.controller.tcpip_forward(address, port as u32).await?;
        // Servers answer 0 (or nothing) when a fixed port was requested
        if bound == 0 {
            Ok(port)
        } else {
            Ok(bound as u16)
        }
    }

    async fn accept_forward(&self, timeout: Duration) -> Result<Option<Self::Channel>, SshError> {
        let mut rx = self.forwarded_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(channel)) => Ok(Some(RusshChannel::new(channel))),
            Ok(None) => Err(SshError::Disconnected),
        }
    }

    async fn cancel_remote_forward(&self, address: &str, port: u16) -> Result<(), SshError> {
        self.controller
            .cancel_tcpip_forward(address, port as u32)
            .await
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;

        // Channels the server opened after we stopped accepting
        let mut rx = self.forwarded_rx.lock().await;
        rx.close();
        while let Ok(channel) = rx.try_recv() {
            let _ = channel.close().await;
        }
    }
}

/// A forwarded-tcpip channel with non-blocking reads
pub struct RusshChannel {
    channel: Channel<client::Msg>,
    pending: BytesMut,
    eof: bool,
    closed: bool,
}

impl RusshChannel {
    fn new(channel: Channel<client::Msg>) -> Self {
        Self {
            channel,
            pending: BytesMut::new(),
            eof: false,
            closed: false,
        }
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

#[async_trait]
impl ForwardedChannel for RusshChannel {
    fn is_open(&self) -> bool {
        !self.closed
    }

    fn is_eof(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    fn try_read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SshError> {
        if !self.pending.is_empty() {
            return Ok(ReadOutcome::Data(self.drain_pending(buf)));
        }
        if self.closed {
            return Err(SshError::ChannelError("Channel is closed".to_string()));
        }
        if self.eof {
            return Ok(ReadOutcome::Eof);
        }

        loop {
            match self.channel.wait().now_or_never() {
                None => return Ok(ReadOutcome::Pending),
                Some(Some(ChannelMsg::Data { data })) => {
                    self.pending.extend_from_slice(&data);
                    return Ok(ReadOutcome::Data(self.drain_pending(buf)));
                }
                Some(Some(ChannelMsg::Eof)) => {
                    self.eof = true;
                    return Ok(ReadOutcome::Eof);
                }
                Some(Some(ChannelMsg::Close)) | Some(None) => {
                    self.eof = true;
                    return Ok(ReadOutcome::Eof);
                }
                // Window adjustments and the like
                Some(Some(_)) => continue,
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    async fn send_eof(&mut self) -> Result<(), SshError> {
        if self.closed {
            return Ok(());
        }
        self.channel
            .eof()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.channel.close().await;
    }
}

/// Handler errors (host key mismatch) already carry their category; socket and
/// protocol failures during the handshake become `TransportConnectFailed`.
fn connect_error(e: SshError) -> SshError {
    match e {
        SshError::IoError(e) => SshError::TransportConnectFailed(e.to_string()),
        SshError::ProtocolError(reason) => SshError::TransportConnectFailed(reason),
        other => other,
    }
}

/// OpenSSH-style "SHA256:<base64>" fingerprint
pub fn fingerprint(key: &PublicKey) -> String {
    let hash = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks
///
/// Verifies the server key and queues every forwarded-tcpip channel the
/// server opens for the forward listener to pick up.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// Expected "SHA256:..." fingerprint, if pinned
    pinned_fingerprint: Option<String>,
    forwarded_tx: mpsc::UnboundedSender<Channel<client::Msg>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        pinned_fingerprint: Option<String>,
        forwarded_tx: mpsc::UnboundedSender<Channel<client::Msg>>,
    ) -> Self {
        Self {
            host,
            port,
            pinned_fingerprint,
            forwarded_tx,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = fingerprint(server_public_key);

        match &self.pinned_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, fingerprint
                );
                Err(SshError::TransportConnectFailed(format!(
                    "Host key verification failed for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, fingerprint
                )))
            }
            Some(_) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                info!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                Ok(true)
            }
        }
    }

    /// The server opened a channel for a connection made to our remote port
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        if let Err(mpsc::error::SendError(channel)) = self.forwarded_tx.send(channel) {
            warn!(
                "No listener for forwarded connection on {}:{}, closing",
                connected_address, connected_port
            );
            let _ = channel.close().await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unused_local_port;
    use tokio::net::TcpListener;

    fn local_server(port: u16) -> ServerConfig {
        let mut server = ServerConfig::with_home(None);
        server.host = "127.0.0.1".to_string();
        server.port = port;
        server.timeout_secs = 1;
        server
    }

    async fn connect_err(server: &ServerConfig) -> SshError {
        match RusshBackend::new().connect(server).await {
            Ok(_) => panic!("connect to {} should fail", server.display_target()),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_connect_timeout_is_transport_failure() {
        // Accepts but never sends an SSH banner
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let started = std::time::Instant::now();
        let err = connect_err(&local_server(port)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        match &err {
            SshError::TransportConnectFailed(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        silent.abort();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_failure() {
        let port = unused_local_port().await;
        let err = connect_err(&local_server(port)).await;
        assert!(matches!(err, SshError::TransportConnectFailed(_)), "{err:?}");
        assert_eq!(err.to_string().matches("Connection failed:").count(), 1);
    }

    #[test]
    fn test_connect_error_keeps_handler_errors() {
        let mismatch = SshError::TransportConnectFailed(
            "Host key verification failed for h:22: expected SHA256:a, got SHA256:b".to_string(),
        );
        let mapped = connect_error(mismatch);
        assert_eq!(
            mapped.to_string(),
            "Connection failed: Host key verification failed for h:22: expected SHA256:a, got SHA256:b"
        );

        let io = SshError::IoError(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(
            connect_error(io),
            SshError::TransportConnectFailed(_)
        ));
        assert!(matches!(
            connect_error(SshError::ProtocolError("bad kex".to_string())),
            SshError::TransportConnectFailed(reason) if reason == "bad kex"
        ));
    }
}
