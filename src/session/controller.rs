//! Session Controller
//!
//! Owns the authenticated SSH session and the private key, and is the only
//! component that touches either. Connect, disconnect and tunnel start/stop
//! are serialized behind one async lifecycle lock, so a teardown never
//! interleaves with a half-finished connect.
//!
//! ```text
//!                connect()
//! Disconnected ───────────▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      │                      error     disconnect()/teardown
//!      │                        ▼                  │
//!      └──── disconnect() ──── Error ◀─────────────┘ (via Disconnected)
//!                               │
//!                               └── connect() ──▶ Connecting
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::events::StateBus;
use super::state::ConnectionState;
use crate::forwarding::{ForwardListener, ForwardStats, ListenerOptions, TunnelSpec};
use crate::ssh::{ServerConfig, SshBackend, SshError, SshTransport};

/// The live session. Exists only between a successful connect and the next
/// disconnect.
struct SessionHandle<B: SshBackend> {
    transport: Arc<B::Transport>,
    // Held for the session's lifetime, released with it
    _key: B::Key,
}

#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    error: Option<String>,
}

pub struct SessionController<B: SshBackend> {
    server: ServerConfig,
    backend: B,
    bus: StateBus,
    status: Mutex<Status>,
    lifecycle: tokio::sync::Mutex<()>,
    handle: RwLock<Option<SessionHandle<B>>>,
    listener: Mutex<Option<ForwardListener>>,
    last_tunnel: Mutex<Option<TunnelSpec>>,
    user_disconnected: AtomicBool,
    listener_options: ListenerOptions,
}

impl<B: SshBackend> SessionController<B> {
    /// `server.key_path` must already be resolved; it is used as given.
    pub fn new(server: ServerConfig, backend: B, bus: StateBus) -> Self {
        Self {
            server,
            backend,
            bus,
            status: Mutex::new(Status::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            handle: RwLock::new(None),
            listener: Mutex::new(None),
            last_tunnel: Mutex::new(None),
            user_disconnected: AtomicBool::new(false),
            listener_options: ListenerOptions::default(),
        }
    }

    pub fn with_listener_options(mut self, options: ListenerOptions) -> Self {
        self.listener_options = options;
        self
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn bus(&self) -> &StateBus {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Message of the most recent failure, kept until the next state change
    pub fn error_message(&self) -> Option<String> {
        self.status.lock().error.clone()
    }

    /// Whether the last stop came from `disconnect()` rather than a failure
    pub fn is_user_disconnected(&self) -> bool {
        self.user_disconnected.load(Ordering::SeqCst)
    }

    /// Connected according to the state machine *and* the transport
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.transport().is_some_and(|t| t.is_alive())
    }

    /// Authenticate to the server. A no-op while connecting or connected.
    pub async fn connect(&self) -> Result<(), SshError> {
        self.user_disconnected.store(false, Ordering::SeqCst);
        self.establish(false).await
    }

    /// Connect on behalf of the supervisor. Gives up if the user has
    /// disconnected in the meantime.
    pub(crate) async fn reconnect(&self) -> Result<(), SshError> {
        self.establish(true).await
    }

    async fn establish(&self, supervised: bool) -> Result<(), SshError> {
        if self.is_busy() {
            debug!("Connect ignored: already {}", self.state());
            return Ok(());
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.is_busy() {
            debug!("Connect ignored: already {}", self.state());
            return Ok(());
        }
        if supervised && self.is_user_disconnected() {
            return Err(SshError::Disconnected);
        }

        self.set_state(ConnectionState::Connecting, None);
        info!("Connecting to {}", self.server.display_target());

        match self.open_session().await {
            Ok(handle) => {
                *self.handle.write() = Some(handle);
                self.set_state(ConnectionState::Connected, None);
                info!("Connected to {}", self.server.display_target());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Connection to {} failed ({:?}): {}",
                    self.server.display_target(),
                    e.category(),
                    e
                );
                self.set_state(ConnectionState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Anything acquired here is dropped on the error paths
    async fn open_session(&self) -> Result<SessionHandle<B>, SshError> {
        let key_path = &self.server.key_path;
        if !key_path.is_file() {
            return Err(SshError::KeyNotFound(key_path.clone()));
        }
        let key = self.backend.load_key(key_path)?;

        let pending = self.backend.connect(&self.server).await?;
        let transport = self
            .backend
            .authenticate(pending, &self.server.username, &key)
            .await?;

        Ok(SessionHandle {
            transport: Arc::new(transport),
            _key: key,
        })
    }

    /// Stop the tunnel, close the session and forget the tunnel spec.
    /// Suppresses automatic reconnection until the next `connect()`.
    pub async fn disconnect(&self) {
        self.user_disconnected.store(true, Ordering::SeqCst);

        let _lifecycle = self.lifecycle.lock().await;
        // After the lock: a start_tunnel holding it would otherwise set it again
        *self.last_tunnel.lock() = None;
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        info!("Disconnecting from {}", self.server.display_target());
        self.release().await;
        self.set_state(ConnectionState::Disconnected, None);
    }

    /// Supervisor-side teardown. Keeps the tunnel spec for restoration and
    /// leaves reconnection enabled.
    pub(crate) async fn teardown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        info!("Tearing down session to {}", self.server.display_target());
        self.release().await;
        self.set_state(ConnectionState::Disconnected, None);
    }

    /// Send a keepalive. False on any failure.
    pub async fn check_health(&self) -> bool {
        let Some(transport) = self.transport() else {
            return false;
        };
        if !transport.is_alive() {
            debug!("Health check: transport reports closed");
            return false;
        }
        match transport.send_keepalive().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Forward `remote_port` on the server to `127.0.0.1:local_port`.
    /// Replaces any running tunnel.
    pub async fn start_tunnel(&self, local_port: u16, remote_port: u16) -> Result<(), SshError> {
        let spec = TunnelSpec::new(local_port, remote_port, &self.server.remote_port_range())?;

        let _lifecycle = self.lifecycle.lock().await;
        self.start_listener(spec).await
    }

    /// Stop the running tunnel, if any, and forget its spec
    pub async fn stop_tunnel(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        *self.last_tunnel.lock() = None;
        self.stop_listener().await;
    }

    /// Restart the last requested tunnel if it is not running.
    /// Returns whether a tunnel was started.
    pub(crate) async fn restore_tunnel(&self) -> Result<bool, SshError> {
        let _lifecycle = self.lifecycle.lock().await;
        let last = *self.last_tunnel.lock();
        let Some(spec) = last else {
            return Ok(false);
        };
        if self.is_tunnel_running() {
            return Ok(false);
        }
        info!("Restoring tunnel {}", spec);
        self.start_listener(spec).await.map(|()| true)
    }

    pub fn is_tunnel_running(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(ForwardListener::is_running)
    }

    /// The tunnel most recently requested by the caller
    pub fn tunnel_spec(&self) -> Option<TunnelSpec> {
        *self.last_tunnel.lock()
    }

    pub fn tunnel_stats(&self) -> Option<ForwardStats> {
        self.listener.lock().as_ref().map(ForwardListener::stats)
    }

    // ── internals (callers hold the lifecycle lock) ─────────────────────────

    async fn start_listener(&self, spec: TunnelSpec) -> Result<(), SshError> {
        self.stop_listener().await;

        // Re-validate: the supervisor may have torn the session down since
        // the caller last looked
        let transport = match self.transport() {
            Some(t) if self.state() == ConnectionState::Connected && t.is_alive() => t,
            _ => return Err(SshError::NotConnected),
        };
        *self.last_tunnel.lock() = Some(spec);

        let listener = ForwardListener::start(
            transport,
            spec,
            self.bus.clone(),
            self.listener_options.clone(),
        )
        .await?;
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn stop_listener(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            debug!("Stopping tunnel {}", listener.spec());
            listener.shutdown().await;
        }
    }

    async fn release(&self) {
        self.stop_listener().await;

        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            handle.transport.disconnect().await;
        }
    }

    fn transport(&self) -> Option<Arc<B::Transport>> {
        self.handle.read().as_ref().map(|h| h.transport.clone())
    }

    fn is_busy(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    fn set_state(&self, next: ConnectionState, error: Option<String>) {
        {
            let mut status = self.status.lock();
            if !status.state.can_transition_to(next) {
                warn!("Unexpected state transition {} -> {}", status.state, next);
            }
            status.state = next;
            status.error = error.clone();
        }
        // Publish outside the lock; the observer may call back in
        self.bus.emit_state(next, error);
    }
}
