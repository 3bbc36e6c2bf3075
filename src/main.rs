//! sshconn - keep a reverse SSH tunnel up
//!
//! # Example Usage
//!
//! ```bash
//! # Use the saved configuration
//! sshconn
//!
//! # Expose local port 8080 as remote port 12345 and remember it
//! sshconn --local-port 8080 --remote-port 12345 --save
//!
//! # Different key, no automatic reconnection
//! sshconn --key ~/.ssh/other_key --no-reconnect
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use sshconn_lib::config::{config_dir, ConfigStorage};
use sshconn_lib::ssh::expand_home;
use sshconn_lib::{
    init_logging, ListenerOptions, ReconnectSupervisor, RusshBackend, ServerConfig,
    SessionController, StateBus, TunnelEvent,
};

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (bridge buffers, channel data)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Reverse SSH tunnel client
#[derive(Parser, Debug)]
#[command(
    name = "sshconn",
    about = "Keep a reverse SSH tunnel to a local service alive",
    version
)]
struct Args {
    /// Directory holding config.json (defaults to the platform config dir)
    #[arg(long, env = "SSHCONN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Private key file (default ~/.ssh/tunnel_key)
    #[arg(long, env = "SSHCONN_KEY")]
    key: Option<String>,

    /// Local port to expose; enables the tunnel
    #[arg(long, requires = "remote_port")]
    local_port: Option<u16>,

    /// Remote port on the server (12000-13000)
    #[arg(long, requires = "local_port")]
    remote_port: Option<u16>,

    /// Do not reconnect automatically
    #[arg(long)]
    no_reconnect: bool,

    /// Bridge up to N forwarded connections at once (1 = sequential)
    #[arg(long, default_value_t = 1)]
    max_bridges: usize,

    /// Write the port and reconnect overrides back to config.json
    #[arg(long)]
    save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let storage = match &args.config_dir {
        Some(dir) => ConfigStorage::in_dir(dir),
        None => ConfigStorage::in_dir(&config_dir().context("Failed to locate config directory")?),
    };
    let mut config = storage.load().await.context("Failed to load configuration")?;

    if let (Some(local), Some(remote)) = (args.local_port, args.remote_port) {
        config.tunnel.local_port = local;
        config.tunnel.remote_port = remote;
        config.tunnel.enabled = true;
    }
    if args.no_reconnect {
        config.auto_reconnect = false;
    }
    if args.save {
        storage.save(&config).await.context("Failed to save configuration")?;
    }

    let home = dirs::home_dir();
    let mut server = ServerConfig::with_home(home.as_deref());
    if let Some(key) = &args.key {
        server = server.with_key_path(expand_home(key, home.as_deref()));
    }

    info!("Configuration: {:?}", storage.path());
    info!("  Server: {}", server.display_target());
    info!("  Key: {}", server.key_path.display());
    info!(
        "  Tunnel: remote:{} -> local:{} ({})",
        config.tunnel.remote_port,
        config.tunnel.local_port,
        if config.tunnel.enabled { "enabled" } else { "disabled" }
    );

    let bus = StateBus::new();
    bus.subscribe(log_event);

    let options = ListenerOptions::default().with_max_concurrent_bridges(args.max_bridges);
    let remote_range = server.remote_port_range();
    let controller = Arc::new(
        SessionController::new(server, RusshBackend::new(), bus).with_listener_options(options),
    );

    match controller.connect().await {
        Ok(()) if config.tunnel.enabled => {
            let spec = config.tunnel_spec(&remote_range)?;
            if let Err(e) = controller
                .start_tunnel(spec.local_port(), spec.remote_port())
                .await
            {
                error!("Failed to start tunnel: {}", e);
            }
        }
        Ok(()) => info!("Tunnel disabled; session kept open"),
        Err(e) => error!("Initial connection failed: {}", e),
    }

    let supervisor = ReconnectSupervisor::spawn(controller.clone(), config.reconnect_policy());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down gracefully...");

    supervisor.shutdown().await;
    controller.disconnect().await;

    info!("Stopped");
    Ok(())
}

fn log_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::StateChanged {
            state,
            error: Some(error),
        } => warn!("State: {} ({})", state, error),
        TunnelEvent::StateChanged { state, error: None } => info!("State: {}", state),
        TunnelEvent::ForwardStarted {
            remote_port,
            local_port,
        } => info!("Forwarding remote:{} -> local:{}", remote_port, local_port),
        TunnelEvent::ForwardStopped { remote_port } => {
            info!("Forward on remote:{} stopped", remote_port)
        }
        TunnelEvent::ForwardFailed { remote_port, error } => {
            error!("Forward on remote:{} failed: {}", remote_port, error)
        }
        TunnelEvent::ReconnectScheduled {
            attempt,
            delay_secs,
        } => info!("Reconnect attempt {} in {:.1}s", attempt, delay_secs),
    }
}
