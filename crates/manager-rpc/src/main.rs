//! Manager RPC Server - JSON-RPC front end for the node and model manager.
//!
//! Wraps `manager-core` in a JSON-RPC 2.0 endpoint so a host application can
//! browse the catalog and drive install, update and uninstall over HTTP.

mod handlers;
mod server;

use anyhow::{anyhow, Result};
use clap::Parser;
use manager_core::{ConflictPolicy, FileRegistryProvider, NodeManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "manager-rpc")]
#[command(about = "JSON-RPC server for the node and model manager")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Editor root holding custom_nodes/ and models/ (defaults to the current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Create the root and its install directories if missing
    #[arg(long)]
    create_dirs: bool,

    /// Base URL of the registry channel
    #[arg(long)]
    channel_url: Option<String>,

    /// Read the registry documents from a local directory instead of the channel
    #[arg(long, conflicts_with = "channel_url")]
    registry_dir: Option<PathBuf>,

    /// Base URL of the running editor, for loaded node type queries
    #[arg(long)]
    host_url: Option<String>,

    /// Maximum operations executing at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Conflict policy for installs and updates: block or warn
    #[arg(long, default_value = "block")]
    conflict_policy: String,

    /// Default acquisition deadline in seconds
    #[arg(long)]
    acquisition_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG overrides the flag-derived level
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Manager RPC Server");

    let root = match args.root {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    info!("Manager root: {}", root.display());

    let policy = ConflictPolicy::from_str(&args.conflict_policy)
        .ok_or_else(|| anyhow!("invalid conflict policy: {}", args.conflict_policy))?;

    let mut builder = NodeManager::builder(&root)
        .auto_create_dirs(args.create_dirs)
        .conflict_policy(policy);
    if let Some(url) = args.channel_url {
        builder = builder.channel_url(url);
    }
    if let Some(dir) = args.registry_dir {
        info!("Reading registry from {}", dir.display());
        builder = builder.registry_provider(Arc::new(FileRegistryProvider::new(dir)));
    }
    if let Some(url) = args.host_url {
        builder = builder.host_url(url);
    }
    if let Some(max) = args.max_concurrent {
        builder = builder.max_concurrent_operations(max);
    }
    if let Some(secs) = args.acquisition_timeout_secs {
        builder = builder.acquisition_timeout(Duration::from_secs(secs));
    }

    let manager = builder.build().await?;

    let addr = server::start_server(manager, &args.host, args.port).await?;

    // Print the port for the parent process to read
    println!("RPC_PORT={}", addr.port());
    info!("RPC server listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
