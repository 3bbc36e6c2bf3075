//! SSH module - authenticated transport to the tunnel server
//!
//! The engine is written against the traits in [`transport`]; [`client`]
//! implements them with russh.
//!
//! # Features
//! - Public-key authentication against one fixed server
//! - Single-owner russh handle (see `handle_owner`)
//! - Remote forward registration and forwarded channel delivery
//! - Keepalive probing for health checks

mod client;
mod config;
mod error;
mod handle_owner;
mod transport;

pub use client::{fingerprint, ClientHandler, RusshBackend, RusshChannel, RusshTransport};
pub use config::{
    expand_home, ServerConfig, DEFAULT_HOST, DEFAULT_KEY_PATH, DEFAULT_PORT, DEFAULT_USER,
    REMOTE_PORT_MAX, REMOTE_PORT_MIN,
};
pub use error::{ErrorCategory, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use transport::{ForwardedChannel, ReadOutcome, SshBackend, SshTransport};
