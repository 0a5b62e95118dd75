use entropygen::Pipeline;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "entropygen starting");

    let settings = entropy_config::Settings::load();
    info!(endpoints = settings.endpoints.len(), "configuration loaded");

    let pipeline = match Pipeline::start(settings) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(error = %err, "fatal: failed to start pipeline");
            std::process::exit(1);
        }
    };

    let memory_task = pipeline.spawn_memory_governor();

    shutdown_signal().await;
    info!("shutdown signal received, draining pipeline");

    pipeline.shutdown().await;
    let _ = memory_task.await;

    info!("entropygen stopped");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
