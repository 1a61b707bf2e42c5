use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod auth;
mod envelope;
mod forwarder;
mod http;
mod receipts;
mod state;
mod transport;
mod worker;

#[derive(Parser)]
#[command(name = "aide-mesh", about = "Signal transport adapter for the Aide assistant")]
struct Cli {
    /// Path to mesh.toml (default: ~/.aide/mesh.toml).
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
                .unwrap_or_else(|_| "aide_mesh=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = aide_core::config::MeshConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("config load failed ({e}), using defaults");
            aide_core::config::MeshConfig::default()
        });
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    // The shared secret is a hard requirement: without it nothing can be
    // verified or signed, so refuse to start.
    let secrets =
        aide_auth::SecretState::load(config.auth.secret.as_deref(), &config.auth.secret_file);
    if secrets.current().is_none() {
        anyhow::bail!(
            "no shared secret configured (set auth.secret or provision {})",
            config.auth.secret_file
        );
    }

    let config_state = Arc::new(state::ConfigState::new(secrets, &config.auth.secret_file));

    // Startup aborts here when the transport binary is missing.
    let (rpc, notifications) = transport::SignalRpc::spawn(&config.transport)?;

    let forwarder = forwarder::Forwarder::spawn(
        config.forward_workers,
        &config.assistant_url,
        config.forward_timeout_secs,
        config_state.clone(),
    );

    let bind = config.http.bind.clone();
    let port = config.http.port;
    let mesh_state = Arc::new(app::MeshState {
        state: config_state,
        nonces: aide_auth::NonceStore::new(aide_core::config::NONCE_RETENTION_MS, 100_000),
        out_limiter: aide_queue::OutboundLimiter::new(
            config.outbound_per_hour,
            config.escalated_per_hour,
        ),
        delivery: receipts::DeliveryTracker::new(),
        rpc,
        config,
    });

    tokio::spawn(worker::receive_loop(
        mesh_state.clone(),
        notifications,
        forwarder,
    ));

    let router = app::build_router(mesh_state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "mesh listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
