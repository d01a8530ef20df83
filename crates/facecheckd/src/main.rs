use anyhow::{Context, Result};
use facecheck_core::{Config, RecognitionService};
use tracing_subscriber::EnvFilter;

mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facecheckd starting");

    let config = Config::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        strategy = ?config.strategy,
        workers = config.workers,
        "configuration loaded"
    );

    // Fail fast: a missing model or unwritable database stops startup here.
    let service = RecognitionService::from_config(&config)
        .context("failed to start recognition service")?;

    match service.reload_cache().await {
        Ok(count) => tracing::info!(encodings = count, "gallery loaded"),
        Err(error) => tracing::warn!(%error, "initial gallery load failed; retrying on first request"),
    }

    let app = server::create_app(server::AppState::new(service));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, "facecheckd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facecheckd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "cannot listen for ctrl-c; shutting down");
    }
}
