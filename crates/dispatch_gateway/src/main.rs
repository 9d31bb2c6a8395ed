//! Gateway entry point: configuration, logging, service wiring, the HTTP
//! listener, and the background sync worker.

mod app;
mod error;
mod http;
mod ws;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dispatch_core::auth::{Claims, Role, TokenSigner};
use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::config::DispatchConfig;
use dispatch_core::ids::UserId;

#[derive(Debug, Parser)]
#[command(name = "dispatch-gateway", about = "Driver dispatch gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Listen address.
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
        /// Path to a JSON config file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Mint a bearer token for a user (operational tooling).
    MintToken {
        /// User id (UUID).
        #[arg(long)]
        user: UserId,
        /// `driver`, `rider`, or `admin`.
        #[arg(long)]
        role: String,
        /// Token lifetime in seconds.
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: u64,
        /// Path to a JSON config file holding the signing secret.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DispatchConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(DispatchConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Serve { bind, config } => serve(bind, config).await,
        Command::MintToken {
            user,
            role,
            ttl_secs,
            config,
        } => mint_token(user, &role, ttl_secs, config),
    }
}

async fn serve(bind: String, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path.as_ref())?;
    let state = app::build_state(config)?;

    let shutdown = CancellationToken::new();
    let sync_task = tokio::spawn(state.sync.clone().run(shutdown.clone()));

    let router = app::build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "dispatch gateway listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sync_task.await;
    Ok(())
}

fn mint_token(
    user: UserId,
    role: &str,
    ttl_secs: u64,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config(config_path.as_ref())?;
    let role = match role {
        "driver" => Role::Driver,
        "rider" => Role::Rider,
        "admin" => Role::Admin,
        other => bail!("unknown role {other:?}"),
    };
    let signer = TokenSigner::new(config.access_token_secret.into_bytes());
    let claims = Claims {
        sub: user,
        role,
        exp: SystemClock.now_ms() + ttl_secs * 1_000,
    };
    println!("{}", signer.issue(&claims));
    Ok(())
}
