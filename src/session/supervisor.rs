//! Reconnect Supervisor
//!
//! Watches the session and rebuilds it when it dies. Every `health_interval`
//! the supervisor sends a keepalive through the controller; a failure tears
//! the session down and enters the retry loop:
//!
//! ```text
//! teardown ─▶ wait(backoff) ─▶ reconnect ─ok─▶ restore tunnel, reset backoff
//!                 ▲                │
//!                 └──── err ───────┘ (delay × multiplier, capped)
//! ```
//!
//! Every failure is retried the same way, authentication failures included.
//! A user `disconnect()` pauses supervision until the next `connect()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::controller::SessionController;
use super::events::TunnelEvent;
use super::state::ConnectionState;
use crate::ssh::SshBackend;

/// Time between health checks, independent of backoff
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Granularity at which waits notice the stop flag
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// First delay, and the delay after any healthy check (seconds)
    pub base_delay_secs: f64,
    /// Cap on the delay (seconds)
    pub max_delay_secs: f64,
    /// Growth factor after each failed attempt
    pub multiplier: f64,
    /// Whether automatic reconnection runs at all
    pub enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 5.0,
            max_delay_secs: 300.0,
            multiplier: 2.0,
            enabled: true,
        }
    }
}

/// Exponential backoff state: 5, 10, 20, ... capped at the maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    base: f64,
    max: f64,
    multiplier: f64,
    current: f64,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let base = sanitize(policy.base_delay_secs);
        let max = sanitize(policy.max_delay_secs).max(base);
        let multiplier = if policy.multiplier.is_finite() && policy.multiplier >= 1.0 {
            policy.multiplier
        } else {
            1.0
        };
        Self {
            base,
            max,
            multiplier,
            current: base,
        }
    }

    /// Delay the next wait would use, in seconds
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Delay before the next attempt
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.current).unwrap_or(Duration::ZERO)
    }

    /// Grow the delay after a failed attempt, capped at the maximum
    pub fn grow(&mut self) {
        self.current = (self.current * self.multiplier).min(self.max);
    }

    /// Take the current delay and grow it for the following attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay();
        self.grow();
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

fn sanitize(secs: f64) -> f64 {
    if secs.is_finite() && secs > 0.0 {
        secs
    } else {
        0.0
    }
}

/// Sleep for `duration` in small steps. Returns false if `stop` was set
/// before the time was up.
pub async fn cancellable_wait(duration: Duration, stop: &AtomicBool) -> bool {
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let step = CANCEL_CHECK_INTERVAL.min(duration - elapsed);
        sleep(step).await;
        elapsed += step;
    }
    !stop.load(Ordering::SeqCst)
}

/// Handle to the background health/reconnect loop
pub struct ReconnectSupervisor {
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ReconnectSupervisor {
    pub fn spawn<B: SshBackend>(
        controller: Arc<SessionController<B>>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::spawn_with_interval(controller, policy, HEALTH_CHECK_INTERVAL)
    }

    pub fn spawn_with_interval<B: SshBackend>(
        controller: Arc<SessionController<B>>,
        policy: ReconnectPolicy,
        health_interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        if !policy.enabled {
            info!("Auto-reconnect disabled");
            return Self { stop, task: None };
        }

        info!(
            "Reconnect supervisor started (health every {:?}, backoff {}s..{}s)",
            health_interval, policy.base_delay_secs, policy.max_delay_secs
        );
        let task = tokio::spawn(supervise(controller, policy, health_interval, stop.clone()));
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Abort the current wait and any further attempt. Does not block.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Reconnect supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

async fn supervise<B: SshBackend>(
    controller: Arc<SessionController<B>>,
    policy: ReconnectPolicy,
    health_interval: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new(&policy);

    while cancellable_wait(health_interval, &stop).await {
        if controller.is_user_disconnected() {
            continue;
        }

        let healthy = match controller.state() {
            ConnectionState::Connected => controller.check_health().await,
            // Someone else is mid-connect
            ConnectionState::Connecting => continue,
            ConnectionState::Error | ConnectionState::Disconnected => false,
        };

        if healthy {
            backoff.reset();
            if controller.tunnel_spec().is_some() && !controller.is_tunnel_running() {
                if let Err(e) = controller.restore_tunnel().await {
                    warn!("Failed to restore tunnel: {}", e);
                }
            }
            continue;
        }

        if !recover(&controller, &mut backoff, &stop).await {
            break;
        }
    }

    debug!("Reconnect supervisor stopped");
}

/// Tear down and retry until connected. Returns false if stopped.
async fn recover<B: SshBackend>(
    controller: &SessionController<B>,
    backoff: &mut Backoff,
    stop: &AtomicBool,
) -> bool {
    if controller.state() == ConnectionState::Connected {
        warn!("Connection lost, tearing down session");
        controller.teardown().await;
    }

    let mut attempt: u32 = 0;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        if controller.is_user_disconnected() {
            return true;
        }

        attempt += 1;
        let delay = backoff.delay();
        controller.bus().emit(TunnelEvent::ReconnectScheduled {
            attempt,
            delay_secs: delay.as_secs_f64(),
        });
        info!(
            "Reconnect attempt {} in {:.1}s",
            attempt,
            delay.as_secs_f64()
        );

        if !cancellable_wait(delay, stop).await {
            return false;
        }

        match controller.reconnect().await {
            Ok(()) if controller.is_connected() => {
                match controller.restore_tunnel().await {
                    Ok(true) => info!("Tunnel restored"),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to restore tunnel: {}", e),
                }
                backoff.reset();
                info!("Reconnected after {} attempt(s)", attempt);
                return true;
            }
            // Another caller connected during the wait and that session has
            // died since; the cached state alone would keep this a no-op.
            Ok(()) if controller.state() == ConnectionState::Connected => {
                warn!("Session from a concurrent connect is dead, tearing down");
                controller.teardown().await;
            }
            Ok(()) => debug!("Reconnect attempt {} raced another connect", attempt),
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                backoff.grow();
            }
        }
    }
}
