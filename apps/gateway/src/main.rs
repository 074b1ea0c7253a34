use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use ucm_gateway::{Collaborators, build_router, build_state, config::GatewayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::from_env();
    let state = build_state(&config, Collaborators::in_memory());
    let app = build_router(state);

    let addr: std::net::SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid BIND address: {}", config.bind))?;
    tracing::info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
