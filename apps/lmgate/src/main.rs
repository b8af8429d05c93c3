use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = lmgate_core::bootstrap::bootstrap_from_env().await?;
    let config = boot.state.config.load();

    let client: Arc<dyn lmgate_core::upstream_client::UpstreamClient> = Arc::new(
        lmgate_core::upstream_client::WreqUpstreamClient::new(
            lmgate_core::upstream_client::UpstreamClientConfig::default(),
        )?,
    );
    let storage: Arc<dyn lmgate_storage::Storage> = boot.storage.clone();
    let engine = Arc::new(lmgate_core::ProxyEngine::new(
        boot.state.clone(),
        client,
        storage.clone(),
    ));

    let app = axum::Router::new()
        .merge(lmgate_router::proxy_router(engine))
        .nest(
            "/admin",
            lmgate_router::admin_router(boot.state.clone(), storage),
        );

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
