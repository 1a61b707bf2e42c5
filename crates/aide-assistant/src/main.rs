use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod auth;
mod handler;
mod http;
mod mesh_client;
mod prompt;
mod rotation;
mod scheduler;
mod tamper;

#[derive(Parser)]
#[command(name = "aide-assistant", about = "LLM orchestrator for the Aide assistant")]
struct Cli {
    /// Path to aide.toml (default: ~/.aide/aide.toml).
    #[arg(long)]
    config: Option<String>,
    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aide_assistant=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = aide_core::config::AssistantConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("config load failed ({e}), using defaults");
            aide_core::config::AssistantConfig::default()
        });
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    let bind = config.http.bind.clone();
    let port = config.http.port;

    let state = Arc::new(app::AppState::new(config)?);

    // One LLM worker drains the priority queue for the whole process.
    tokio::spawn(state.queue.clone().run_worker());

    // Background ticker: ingestion, tamper, config sync, rotation.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(scheduler::run(state.clone(), shutdown_rx));

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "assistant listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    drop(shutdown_tx);
    Ok(())
}
