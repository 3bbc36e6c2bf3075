//! Forward statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a tunnel's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Forwarded connections accepted
    pub connection_count: u64,
    /// Connections currently bridged
    pub active_connections: u64,
    /// Accepted connections whose local dial failed
    pub failed_dials: u64,
    /// Bytes written to the local service
    pub bytes_to_local: u64,
    /// Bytes written back through the tunnel
    pub bytes_to_remote: u64,
}

/// Lock-free counters updated from the accept loop and bridges
#[derive(Debug, Default)]
pub struct ForwardStatsAtomic {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub failed_dials: AtomicU64,
    pub bytes_to_local: AtomicU64,
    pub bytes_to_remote: AtomicU64,
}

impl ForwardStatsAtomic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_dials: self.failed_dials.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
        }
    }
}
