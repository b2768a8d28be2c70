//! Container-side daemon: ingress, control, and data listeners.

use tracing_subscriber::EnvFilter;
use warren::config::Config;
use warren::container::ContainerSide;

#[tokio::main]
async fn main() -> warren::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    let container = ContainerSide::bind(&config).await?;
    let handle = container.handle();
    let server = tokio::spawn(container.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(err) => tracing::error!(%err, "failed to listen for shutdown signal"),
    }
    handle.shutdown();
    let _ = server.await;
    Ok(())
}
