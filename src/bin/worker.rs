//! Worker process entrypoint: wires up tracing, configuration, a
//! Postgres-backed store and queue, and runs the dequeue loop alongside
//! the recovery sweep until SIGTERM/SIGINT.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workflow_core::config::Config;
use workflow_core::handler::TaskHandlerRegistry;
use workflow_core::orchestrator::Orchestrator;
use workflow_core::queue::PostgresTaskQueue;
use workflow_core::retry::RetryPolicy;
use workflow_core::store::PostgresWorkflowStore;
use workflow_core::worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(queue_name = %config.queue_name, worker_concurrency = config.worker_concurrency, "starting worker");

    let pool = PgPoolOptions::new().max_connections(10).connect(&config.database_url).await?;
    let store = Arc::new(PostgresWorkflowStore::new(pool.clone()));
    let queue = Arc::new(PostgresTaskQueue::new(pool, config.queue_processing_timeout_secs));

    // The concrete handler catalog (HTTP call, transform, delay,
    // conditional, log) lives outside this crate's scope; a deployment
    // registers its own handlers here before starting the worker.
    let registry = Arc::new(TaskHandlerRegistry::new());

    let retry_policy = RetryPolicy::new(config.retry_base_delay, config.retry_max_delay);
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), registry, retry_policy));

    let worker_config = WorkerConfig {
        max_delivery_attempts: config.max_retries,
        ..Default::default()
    };
    let worker = Arc::new(Worker::new(queue, orchestrator, worker_config));

    let dequeue_worker = Arc::clone(&worker);
    let dequeue_handle = tokio::spawn(async move { dequeue_worker.run().await });
    let recovery_worker = Arc::clone(&worker);
    let recovery_handle = tokio::spawn(async move { recovery_worker.run_recovery_loop().await });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");
    worker.shutdown();

    let _ = tokio::join!(dequeue_handle, recovery_handle);
    tracing::info!("worker stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
