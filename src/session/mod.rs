//! Session Management Module
//!
//! Provides the connection lifecycle for the tunnel:
//! - State machine for the SSH session
//! - Controller owning the transport and key
//! - Event bus for state and tunnel notifications
//! - Health checks with reconnection under exponential backoff

mod controller;
mod events;
mod state;
mod supervisor;

pub use controller::SessionController;
pub use events::{StateBus, TunnelEvent};
pub use state::ConnectionState;
pub use supervisor::{
    cancellable_wait, Backoff, ReconnectPolicy, ReconnectSupervisor, HEALTH_CHECK_INTERVAL,
};
