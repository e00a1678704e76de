//! Binary entry point.

use clap::Parser;
use recall_server::{server, ServerConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Self-hosted sync server for spaced-repetition clients.
#[derive(Parser, Debug)]
#[command(name = "recall-server", version)]
struct Args {
    /// Address to bind to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to.
    #[arg(long)]
    port: Option<u16>,

    /// Root directory for per-user data.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Credential database; omit to accept any password (development).
    #[arg(long)]
    auth_db: Option<PathBuf>,

    /// Session database; defaults to <root>/session.db.
    #[arg(long)]
    session_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = ServerConfig::default().overlay_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(root) = args.root {
        config.data_root = root;
    }
    if let Some(path) = args.auth_db {
        config.auth_db = Some(path);
    }
    if let Some(path) = args.session_db {
        config.session_db = Some(path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    if let Err(err) = server::run(config).await {
        tracing::error!("server exited with error: {err}");
        std::process::exit(1);
    }
}
