//! Edge-side daemon backed by the in-memory object store.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use warren::config::Config;
use warren::edge::{ContainerStatus, EdgeConfig, EdgeSide};
use warren::store::adapter::StoreAdapter;
use warren::store::memory::MemoryStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    let mut buckets = config.buckets.clone();
    buckets.push(config.default_bucket.clone());
    let store = Arc::new(MemoryStore::new(buckets.clone()));
    let adapter = StoreAdapter::new(store, config.default_bucket.clone(), config.buckets.clone());

    let (status_tx, status_rx) = watch::channel(ContainerStatus::Running);
    let edge = Arc::new(EdgeSide::new(
        EdgeConfig::from_config(&config),
        adapter,
        status_rx,
    ));
    let supervisor = edge.spawn_supervisor();

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(err) => tracing::error!(%err, "failed to listen for shutdown signal"),
    }
    edge.request_stop();
    let _ = status_tx.send(ContainerStatus::Stopping);
    supervisor.wait().await;
}
