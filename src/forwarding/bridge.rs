//! Connection Bridge
//!
//! Pumps bytes between one forwarded channel and a fresh TCP connection to
//! the local service. The pump polls both sides without blocking and sleeps
//! briefly when neither has data, which keeps one tunnel cheap when idle and
//! lets the stop flag be observed within one sleep. A write the other side
//! is not draining is raced against the stop flag.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::spec::LOCAL_TARGET_HOST;
use super::stats::ForwardStatsAtomic;
use crate::ssh::{ForwardedChannel, ReadOutcome, SshError};

/// Copy buffer size for each direction
pub const BRIDGE_BUFFER_SIZE: usize = 32768;

/// Sleep between pump iterations when neither side had data
pub const PUMP_IDLE_SLEEP: Duration = Duration::from_millis(1);

const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a blocked write checks the stop flag
const BLOCKED_WRITE_STOP_POLL: Duration = Duration::from_millis(10);

/// Why a pump loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Inbound channel reached end-of-stream or was closed
    RemoteEof,
    /// Reading from or writing to the inbound channel failed
    RemoteError,
    /// Local service closed its side
    LocalClosed,
    /// Local socket failed with something other than "would block"
    LocalError,
    /// Listener asked us to stop
    StopRequested,
}

/// Bridges forwarded channels to `127.0.0.1:<local_port>`
#[derive(Clone)]
pub struct ConnectionBridge {
    local_port: u16,
    stop: Arc<AtomicBool>,
    stats: Arc<ForwardStatsAtomic>,
}

impl ConnectionBridge {
    pub fn new(local_port: u16, stop: Arc<AtomicBool>, stats: Arc<ForwardStatsAtomic>) -> Self {
        Self {
            local_port,
            stop,
            stats,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Bridge one forwarded channel until either side finishes.
    ///
    /// A failed local dial closes the channel and returns the error without
    /// entering the pump; the caller should log it and keep accepting.
    pub async fn run<C: ForwardedChannel>(&self, mut channel: C) -> Result<PumpExit, SshError> {
        let local = match dial_local(self.local_port).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.failed_dials.fetch_add(1, Ordering::Relaxed);
                channel.close().await;
                return Err(e);
            }
        };

        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut context = BridgeContext { channel, local };
        let exit = context.pump(&self.stop, &self.stats).await;
        context.release().await;

        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        debug!("Bridge to local port {} ended: {:?}", self.local_port, exit);
        Ok(exit)
    }
}

/// Dial the local service
pub async fn dial_local(port: u16) -> Result<TcpStream, SshError> {
    let addr = format!("{}:{}", LOCAL_TARGET_HOST, port);
    let stream = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| SshError::LocalDialFailed {
            port,
            reason: "connect timed out".to_string(),
        })?
        .map_err(|e| SshError::LocalDialFailed {
            port,
            reason: e.to_string(),
        })?;

    // Interactive traffic should not wait on Nagle
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    Ok(stream)
}

/// Resolves once the stop flag is set
async fn stop_requested(stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(BLOCKED_WRITE_STOP_POLL).await;
    }
}

/// Handles owned by one bridged connection. Lives exactly as long as the pump.
struct BridgeContext<C: ForwardedChannel> {
    channel: C,
    local: TcpStream,
}

impl<C: ForwardedChannel> BridgeContext<C> {
    async fn pump(&mut self, stop: &AtomicBool, stats: &ForwardStatsAtomic) -> PumpExit {
        let mut inbound_buf = vec![0u8; BRIDGE_BUFFER_SIZE];
        let mut local_buf = vec![0u8; BRIDGE_BUFFER_SIZE];

        loop {
            if stop.load(Ordering::SeqCst) {
                return PumpExit::StopRequested;
            }
            if !self.channel.is_open() || self.channel.is_eof() {
                return PumpExit::RemoteEof;
            }

            let mut idle = true;

            // Channel -> local socket
            match self.channel.try_read(&mut inbound_buf) {
                Ok(ReadOutcome::Data(n)) => {
                    idle = false;
                    tokio::select! {
                        result = self.local.write_all(&inbound_buf[..n]) => {
                            if let Err(e) = result {
                                debug!("Local write failed: {}", e);
                                return PumpExit::LocalError;
                            }
                        }
                        _ = stop_requested(stop) => return PumpExit::StopRequested,
                    }
                    stats.bytes_to_local.fetch_add(n as u64, Ordering::Relaxed);
                }
                Ok(ReadOutcome::Pending) => {}
                Ok(ReadOutcome::Eof) => return PumpExit::RemoteEof,
                Err(e) => {
                    debug!("Channel read failed: {}", e);
                    return PumpExit::RemoteError;
                }
            }

            // Local socket -> channel
            match self.local.try_read(&mut local_buf) {
                Ok(0) => return PumpExit::LocalClosed,
                Ok(n) => {
                    idle = false;
                    tokio::select! {
                        result = self.channel.write_all(&local_buf[..n]) => {
                            if let Err(e) = result {
                                debug!("Channel write failed: {}", e);
                                return PumpExit::RemoteError;
                            }
                        }
                        _ = stop_requested(stop) => return PumpExit::StopRequested,
                    }
                    stats.bytes_to_remote.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("Local read failed: {}", e);
                    return PumpExit::LocalError;
                }
            }

            if idle {
                tokio::time::sleep(PUMP_IDLE_SLEEP).await;
            }
        }
    }

    /// Release both handles. Runs on every exit path.
    async fn release(mut self) {
        let _ = self.channel.send_eof().await;
        self.channel.close().await;
        let _ = self.local.shutdown().await;
    }
}
