//! Tunnel service daemon
//!
//! Owns the authoritative state of every tunnel and serves lifecycle
//! commands from front-end clients over a Unix domain socket. Runs until a
//! client sends `Quit` or the process receives SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tunnel_service::{
    dataplane, IniConfigParser, IpcServer, LifecycleController, NotificationBus, TunnelRegistry,
};

/// Command-line arguments for the tunnel service
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to the Unix Domain Socket for IPC (overrides the configuration)
    #[clap(short, long)]
    socket_path: Option<PathBuf>,

    /// Log level (overrides the configuration)
    #[clap(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let _guard = init_logging(LogOptions {
        level: parse_level(level),
        log_dir: config.log_dir.clone(),
        log_file_name: "tunneld".to_string(),
        json_format: config.log_json,
        ..Default::default()
    });

    info!("Tunnel service starting up");
    debug!(config = %config_path.display(), "Configuration loaded");

    let dataplane = dataplane::from_config(&config.dataplane)
        .context("failed to set up the dataplane")?;
    let bus = NotificationBus::new(config.service.event_queue_capacity);
    let registry = Arc::new(TunnelRegistry::new(bus));
    let controller = Arc::new(LifecycleController::new(
        registry,
        dataplane,
        Arc::new(IniConfigParser),
    ));

    match controller.adopt_running().await {
        Ok(0) => debug!("No running tunnels discovered"),
        Ok(count) => info!(count, "Adopted running tunnels"),
        Err(e) => warn!(error = %e, "Tunnel discovery failed"),
    }

    let socket_path = args
        .socket_path
        .unwrap_or_else(|| PathBuf::from(&config.service.socket_path));
    let server = IpcServer::bind(&socket_path, config.service.socket_mode, Arc::clone(&controller))
        .with_context(|| format!("failed to bind to socket {}", socket_path.display()))?;

    let mut server_handle = tokio::spawn(server.run());

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let finished = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            None
        }
        result = &mut server_handle => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            // Tunnels are left running and get adopted on the next start
            if let Err(e) = controller.quit(false).await {
                warn!(error = %e, "Quit after signal failed");
            }
            server_handle.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "IPC server failed"),
        Err(e) => error!(error = %e, "Error waiting for IPC server to finish"),
    }

    info!("Tunnel service shut down");
    Ok(())
}
