//! Tunnel control client
//!
//! Unprivileged front-end for the tunnel service: issues lifecycle commands
//! and renders the service's tunnel table.

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info};
use shared_utils::config::Config;
use shared_utils::keys;
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tunnel_client::{MirrorChange, MirrorSession, ServiceClient};
use tunnel_ipc::TunnelUpdate;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to the service socket (overrides the configuration)
    #[clap(short, long)]
    socket_path: Option<PathBuf>,

    /// Log level
    #[clap(short, long, default_value = "warn")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

/// Subcommands for the client
#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the service is reachable
    Ping,

    /// Register a tunnel from a configuration file
    Create {
        name: String,
        /// Tunnel configuration file
        #[clap(long)]
        file: PathBuf,
    },

    /// Bring a tunnel up
    Start { name: String },

    /// Bring a tunnel down
    Stop { name: String },

    /// Remove a stopped tunnel
    Delete { name: String },

    /// Show every tunnel
    List,

    /// Show one tunnel
    State { name: String },

    /// Follow tunnel state changes until the service halts
    Watch,

    /// Halt the service
    Quit {
        /// Stop running tunnels first
        #[clap(long)]
        stop_outstanding: bool,
    },

    /// Print the public key for a base64 private key read from stdin
    Pubkey,
}

fn print_tunnel(tunnel: &TunnelUpdate) {
    println!("{:<32} {:<10} {}", tunnel.name, tunnel.state, tunnel.seq);
}

fn print_public_key() -> anyhow::Result<()> {
    let mut private_key = String::new();
    std::io::stdin()
        .read_to_string(&mut private_key)
        .context("failed to read private key from stdin")?;
    println!("{}", keys::public_key_from_base64(&private_key)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = init_logging(LogOptions {
        level: parse_level(&args.log_level),
        include_file_line: false,
        ..Default::default()
    });

    if matches!(args.command, Command::Pubkey) {
        return print_public_key();
    }

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    let socket_path = args
        .socket_path
        .unwrap_or_else(|| PathBuf::from(&config.client.socket_path));
    debug!("Service socket path: {}", socket_path.display());

    let (client, events) = ServiceClient::connect(&socket_path, config.client.request_timeout())
        .await
        .with_context(|| format!("failed to connect to service at {}", socket_path.display()))?;

    match args.command {
        Command::Ping => {
            client.ping().await?;
            println!("service is responsive");
        }
        Command::Create { name, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            print_tunnel(&client.create(&name, &text).await?);
        }
        Command::Start { name } => print_tunnel(&client.start(&name).await?),
        Command::Stop { name } => print_tunnel(&client.stop(&name).await?),
        Command::Delete { name } => {
            client.delete(&name).await?;
            println!("deleted {name}");
        }
        Command::List => {
            let snapshot = client.list().await?;
            for tunnel in &snapshot.tunnels {
                print_tunnel(tunnel);
            }
        }
        Command::State { name } => print_tunnel(&client.state(&name).await?),
        Command::Watch => {
            let mut session = MirrorSession::start(Arc::new(client), events).await?;
            info!("Watching tunnel state, press Ctrl+C to exit");

            loop {
                tokio::select! {
                    change = session.next_change() => match change {
                        Some(MirrorChange::Updated(tunnel)) => print_tunnel(&tunnel),
                        Some(MirrorChange::Removed { name }) => println!("{name:<32} removed"),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Quit { stop_outstanding } => {
            client.quit(stop_outstanding).await?;
            println!("service is shutting down");
        }
        Command::Pubkey => print_public_key()?,
    }

    Ok(())
}
