//! Forward Listener
//!
//! Registers the remote port forward on an established session and runs the
//! accept loop that hands each forwarded channel to a [`ConnectionBridge`].
//!
//! ## Lifecycle
//!
//! 1. `start` checks the session is live and sends the tcpip-forward request.
//!    A rejected request is reported on the bus and nothing is spawned.
//! 2. The accept loop waits at most `accept_timeout` per iteration, so the
//!    stop flag is seen within one poll.
//! 3. On exit the forward is cancelled and `ForwardStopped` is published.
//!
//! By default bridges run inline, one connection at a time. With
//! `max_concurrent_bridges > 1` each channel gets its own task, bounded by a
//! semaphore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::bridge::{ConnectionBridge, PumpExit};
use super::spec::{TunnelSpec, REMOTE_BIND_ADDRESS};
use super::stats::{ForwardStats, ForwardStatsAtomic};
use crate::session::{StateBus, TunnelEvent};
use crate::ssh::{ForwardedChannel, SshError, SshTransport};

/// Upper bound on one accept wait, and so on stop latency
pub const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Back-off after an accept error on a session that still looks alive
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Accept loop tuning
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// How long one accept waits before re-checking the stop flag
    pub accept_timeout: Duration,
    /// Bridges allowed at once. 1 bridges inline, one connection at a time.
    pub max_concurrent_bridges: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            accept_timeout: ACCEPT_POLL_TIMEOUT,
            max_concurrent_bridges: 1,
        }
    }
}

impl ListenerOptions {
    pub fn with_max_concurrent_bridges(mut self, max: usize) -> Self {
        self.max_concurrent_bridges = max.max(1);
        self
    }

    fn is_concurrent(&self) -> bool {
        self.max_concurrent_bridges > 1
    }
}

/// Handle to a running accept loop
pub struct ForwardListener {
    spec: TunnelSpec,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<ForwardStatsAtomic>,
    task: Option<JoinHandle<()>>,
}

impl ForwardListener {
    /// Register the remote forward and spawn the accept loop
    pub async fn start<T: SshTransport>(
        transport: Arc<T>,
        spec: TunnelSpec,
        bus: StateBus,
        options: ListenerOptions,
    ) -> Result<Self, SshError> {
        if !transport.is_alive() {
            warn!("Cannot start tunnel: not connected");
            return Err(SshError::NotConnected);
        }

        info!("Requesting remote port forward: {}", spec);

        let bound_port = match transport
            .request_remote_forward(REMOTE_BIND_ADDRESS, spec.remote_port())
            .await
        {
            Ok(port) => port,
            Err(e) => {
                warn!("Failed to request port forward {}: {}", spec, e);
                bus.emit(TunnelEvent::ForwardFailed {
                    remote_port: spec.remote_port(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        let spec = spec.with_bound_port(bound_port);

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ForwardStatsAtomic::new());

        bus.emit(TunnelEvent::ForwardStarted {
            remote_port: spec.remote_port(),
            local_port: spec.local_port(),
        });
        info!("Reverse tunnel started: {}", spec);

        let task = tokio::spawn(accept_loop(
            transport,
            spec,
            AcceptLoopState {
                stop: stop.clone(),
                running: running.clone(),
                stats: stats.clone(),
            },
            bus,
            options,
        ));

        Ok(Self {
            spec,
            stop,
            running,
            stats,
            task: Some(task),
        })
    }

    /// Ask the accept loop to exit. Does not wait.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the accept loop (and any bridges) to finish
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop for {} ended abnormally: {}", self.spec, e);
            }
        }
    }

    /// Stop and join
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The spec this listener serves, with the port the server bound
    pub fn spec(&self) -> TunnelSpec {
        self.spec
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.to_stats()
    }
}

impl Drop for ForwardListener {
    fn drop(&mut self) {
        // An abandoned listener must not keep accepting
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct AcceptLoopState {
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<ForwardStatsAtomic>,
}

async fn accept_loop<T: SshTransport>(
    transport: Arc<T>,
    spec: TunnelSpec,
    state: AcceptLoopState,
    bus: StateBus,
    options: ListenerOptions,
) {
    let AcceptLoopState {
        stop,
        running,
        stats,
    } = state;
    let bridge = ConnectionBridge::new(spec.local_port(), stop.clone(), stats.clone());
    let limit = Arc::new(Semaphore::new(options.max_concurrent_bridges.max(1)));
    let mut bridges: JoinSet<()> = JoinSet::new();

    while !stop.load(Ordering::SeqCst) {
        while let Some(result) = bridges.try_join_next() {
            if let Err(e) = result {
                warn!("Bridge task failed: {}", e);
            }
        }

        let permit = if options.is_concurrent() {
            match acquire_permit(&limit, &stop, options.accept_timeout).await {
                Some(permit) => Some(permit),
                None => break,
            }
        } else {
            None
        };

        match transport.accept_forward(options.accept_timeout).await {
            // Timeout: nothing arrived, re-check the stop flag
            Ok(None) => continue,
            Ok(Some(channel)) => {
                stats.connection_count.fetch_add(1, Ordering::Relaxed);
                debug!("Accepted forwarded connection on {}", spec);

                match permit {
                    Some(permit) => {
                        let bridge = bridge.clone();
                        bridges.spawn(async move {
                            let _permit = permit;
                            log_bridge_result(bridge.local_port(), bridge.run(channel).await);
                        });
                    }
                    None => {
                        log_bridge_result(spec.local_port(), bridge.run(channel).await);
                    }
                }
            }
            Err(e) => {
                if !transport.is_alive() {
                    warn!("Session lost, accept loop for {} exiting: {}", spec, e);
                    break;
                }
                warn!("Error accepting tunnel connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
    }

    while let Some(result) = bridges.join_next().await {
        if let Err(e) = result {
            warn!("Bridge task failed: {}", e);
        }
    }

    if let Err(e) = transport
        .cancel_remote_forward(REMOTE_BIND_ADDRESS, spec.remote_port())
        .await
    {
        warn!("Error canceling port forward {}: {}", spec, e);
    }

    // Connections the server queued after we stopped looking
    while let Ok(Some(mut channel)) = transport.accept_forward(Duration::ZERO).await {
        channel.close().await;
    }

    running.store(false, Ordering::SeqCst);
    bus.emit(TunnelEvent::ForwardStopped {
        remote_port: spec.remote_port(),
    });
    info!("Reverse tunnel stopped: remote:{}", spec.remote_port());
}

/// Wait for a bridge slot, giving up when stop is requested
async fn acquire_permit(
    limit: &Arc<Semaphore>,
    stop: &AtomicBool,
    poll: Duration,
) -> Option<OwnedSemaphorePermit> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        match tokio::time::timeout(poll, limit.clone().acquire_owned()).await {
            Ok(Ok(permit)) => return Some(permit),
            Ok(Err(_)) => return None,
            Err(_) => continue,
        }
    }
}

fn log_bridge_result(local_port: u16, result: Result<PumpExit, SshError>) {
    match result {
        Ok(exit) => debug!("Tunnel connection to local port {} ended: {:?}", local_port, exit),
        // One bad downstream connection must not take the tunnel down
        Err(e) => warn!("Tunnel connection dropped: {}", e),
    }
}
