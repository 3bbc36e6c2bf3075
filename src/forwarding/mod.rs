//! Port Forwarding Module
//!
//! Reverse (remote) port forwarding over one SSH session: the server listens
//! on a port in its allowed range and every connection it accepts is bridged
//! to a service on `127.0.0.1`.

mod bridge;
mod listener;
mod spec;
mod stats;

pub use bridge::{dial_local, ConnectionBridge, PumpExit, BRIDGE_BUFFER_SIZE, PUMP_IDLE_SLEEP};
pub use listener::{ForwardListener, ListenerOptions, ACCEPT_POLL_TIMEOUT};
pub use spec::{TunnelSpec, LOCAL_TARGET_HOST, REMOTE_BIND_ADDRESS};
pub use stats::{ForwardStats, ForwardStatsAtomic};
