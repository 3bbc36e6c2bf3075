//! Handle Owner Task
//!
//! Only one task owns the russh `Handle<ClientHandler>`. Everything else talks
//! to it through a [`HandleController`], which sends commands over an mpsc
//! channel and waits for the reply on a oneshot.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let bound_port = controller.tcpip_forward("127.0.0.1", 12000).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How long a keepalive may take before it counts as lost
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the owner task checks whether russh closed the connection
const CLOSED_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Ping result, separating "slow" from "gone"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time (network latency, may recover)
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Keepalive probe
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Cheap, cloneable access to the owner task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    alive: Arc<AtomicBool>,
}

impl HandleController {
    /// Request remote port forward. Returns the port the server bound.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardRequestFailed(e.to_string()))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardRequestFailed(e.to_string()))
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// False once the owner task has exited or russh closed the connection
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, consuming the handle
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let alive = Arc::new(AtomicBool::new(true));
    let alive_task = alive.clone();

    tokio::spawn(async move {
        let mut handle = handle; // sole owner from here on
        let mut closed_check = tokio::time::interval(CLOSED_CHECK_INTERVAL);
        closed_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    };
                    match cmd {
                        HandleCommand::TcpipForward { address, port, reply_tx } => {
                            let result = handle.tcpip_forward(address.as_str(), port).await;
                            match result {
                                Ok(bound_port) => {
                                    if reply_tx.send(Ok(bound_port)).is_err() {
                                        // Nobody will ever cancel this forward
                                        warn!(
                                            "Caller dropped after tcpip_forward succeeded. \
                                             Cancelling orphaned forward {}:{}",
                                            address, bound_port
                                        );
                                        let _ = handle
                                            .cancel_tcpip_forward(address.as_str(), bound_port)
                                            .await;
                                    }
                                }
                                Err(e) => {
                                    let _ = reply_tx.send(Err(e));
                                }
                            }
                        }

                        HandleCommand::CancelTcpipForward { address, port, reply_tx } => {
                            let result = handle.cancel_tcpip_forward(address.as_str(), port).await;
                            let _ = reply_tx.send(result);
                        }

                        HandleCommand::Ping { reply_tx } => {
                            debug!("Keepalive probe for session {}", session_id);
                            let result = match tokio::time::timeout(
                                PING_TIMEOUT,
                                handle.send_keepalive(true),
                            )
                            .await
                            {
                                Ok(Ok(())) => PingResult::Ok,
                                Ok(Err(e)) => {
                                    warn!("Keepalive failed for session {}: {}", session_id, e);
                                    PingResult::IoError
                                }
                                Err(_) => {
                                    warn!(
                                        "Keepalive timeout for session {} ({}s)",
                                        session_id,
                                        PING_TIMEOUT.as_secs()
                                    );
                                    PingResult::Timeout
                                }
                            };
                            let _ = reply_tx.send(result);
                        }

                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for session {}", session_id);
                            break;
                        }
                    }
                }

                _ = closed_check.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection closed underneath session {}", session_id);
                        break;
                    }
                }
            }
        }

        alive_task.store(false, Ordering::SeqCst);
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx, alive }
}

/// Fail every queued command with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
