#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # aero
//!
//! Peer directory and file-transfer node.
//!
//! ## Subcommands
//!
//! - `aero serve` (default): run a node until SIGINT/SIGTERM
//!
//! ## Ports
//!
//! | Port            | Protocol   | Auth                | Purpose                    |
//! |-----------------|------------|---------------------|----------------------------|
//! | `rpc_port`      | HTTP/JSON  | `jwt` header        | Registry (`/rpc/*`)        |
//! | `rpc_port`      | HTTP       | No                  | `GET /health`              |
//! | `transfer_port` | raw TCP    | source address      | File bytes by content hash |

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use aero::{
    Aero, AuthGate, Config, Device, FileKeyProvider, FileSink, MessageSink, Role, TracingSink,
};

/// Peer directory and file-transfer node.
#[derive(Parser)]
#[command(name = "aero", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Run as master regardless of the config file.
        #[arg(long)]
        master: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, force_master) = match cli.command {
        Some(Commands::Serve { config, master }) => (config, master),
        None => (None, false),
    };

    let mut config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("aero: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.node.master |= force_master;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("aero v{} starting", env!("CARGO_PKG_VERSION"));

    let gate = AuthGate::new(&FileKeyProvider::new(&config.auth.key_path))?;
    let messages: Arc<dyn MessageSink> = match &config.logging.file {
        Some(path) if !path.is_empty() => Arc::new(FileSink::open(Path::new(path))?),
        _ => Arc::new(TracingSink),
    };

    let role = if config.node.master {
        Role::Master
    } else {
        Role::Peer
    };
    let device = Device::new(
        config.node.identity_hash(),
        config.node.name.clone(),
        config.node.ip.clone(),
        config.node.rpc_port,
        config.node.transfer_port,
    );
    info!("Device: {} ({})", device.name, device.identity_hash);

    let node = Aero::new(
        device,
        role,
        gate,
        config.transfer.download_dir.clone(),
        messages,
    );
    node.start().await?;

    for path in &config.node.shared {
        if let Err(e) = node.add_file(path).await {
            warn!("not offering {path}: {e}");
        }
    }

    if role == Role::Peer {
        match config.node.master_addr.as_deref() {
            Some(addr) => {
                if let Err(e) = node.join(addr).await {
                    node.stop().await;
                    return Err(e.into());
                }
            }
            None => warn!("no master_addr configured; running unjoined"),
        }
    }

    info!("Node ready ({})", role.as_str());
    shutdown_signal().await?;

    info!("Shutting down...");
    node.stop().await;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => { r?; info!("Received SIGINT"); }
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        info!("Received SIGINT");
    }
    Ok(())
}
