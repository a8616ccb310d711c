mod handlers;
mod sessions;
mod state;

use crate::state::{AppState, CoordinatorConfig};
use anyhow::Context;
use common::TransportListener;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,common=debug,tower_http=info")),
        )
        .init();

    let config = CoordinatorConfig::from_env();
    info!(
        "corpus={} fuente={} bundles={} recibidos={} modo={}",
        config.corpus_dir.display(),
        config.source_dir.display(),
        config.bundles_dir.display(),
        config.received_dir.display(),
        config.split_mode
    );
    let state = AppState::new(config.clone());

    // listener de transporte para los workers
    let transport = TransportListener::bind(&config.transport_addr, config.transport())
        .await
        .with_context(|| format!("no se pudo abrir {}", config.transport_addr))?;
    tokio::spawn(sessions::serve_transport(transport, state.clone()));

    // router HTTP
    let app = handlers::build_router(state);
    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("no se pudo abrir {}", config.http_addr))?;
    info!("coordinator escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
