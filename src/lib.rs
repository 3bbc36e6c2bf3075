//! sshconn - persistent reverse SSH tunnel
//!
//! Authenticates to a fixed server with a private key, asks it to forward a
//! remote port back through the session, and bridges every inbound connection
//! to a local TCP service. A supervisor health-checks the session and rebuilds
//! it with exponential backoff when it dies.
//!
//! ```text
//! SessionController ── start_tunnel ──▶ ForwardListener ──▶ ConnectionBridge
//!        ▲                                                     (per stream)
//!        └────── ReconnectSupervisor (health / backoff)
//!
//! every component ──▶ StateBus ──▶ observer
//! ```

pub mod config;
pub mod forwarding;
pub mod session;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AppConfig, ConfigStorage, StorageError};
pub use forwarding::{ForwardStats, ListenerOptions, TunnelSpec};
pub use session::{
    ConnectionState, ReconnectPolicy, ReconnectSupervisor, SessionController, StateBus,
    TunnelEvent,
};
pub use ssh::{RusshBackend, ServerConfig, SshError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
