use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use csvdrop_server::{build_router, AppState, ServerConfig};
use csvdrop_transfer::{DEFAULT_UPLOAD_DIR, MAX_UPLOAD_SIZE};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "CSV file upload daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        #[arg(long, default_value = "config/server.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    #[serde(default)]
    storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
    allowed_origin: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    upload_dir: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
    }
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config_source = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    let config: RuntimeConfig = toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))?;

    if !exposes_publicly(&config.http.bind) {
        info!("loopback bind detected: uploads only reachable locally");
    } else {
        warn!("non-loopback bind detected: uploads are unauthenticated");
    }

    let server_config = ServerConfig {
        http_bind: config.http.bind.clone(),
        allowed_origin: config.http.allowed_origin.clone(),
        upload_dir: config.storage.upload_dir.clone(),
    };

    let state = AppState::new(server_config);
    let app = build_router(state)?;

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(
        bind = %config.http.bind,
        upload_dir = %config.storage.upload_dir,
        max_upload_bytes = MAX_UPLOAD_SIZE,
        "csvdropd listening"
    );
    axum::serve(listener, app).await.context("axum server failed")
}

fn exposes_publicly(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
