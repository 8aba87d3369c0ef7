use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use costwise_api::app::{self, services::JobServices};
use costwise_api::config::ApiConfig;
use costwise_infra::jobs::{HandlerRegistry, InMemoryJobStore, JobStore, PostgresJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    costwise_observability::init();

    let config = ApiConfig::from_env();
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    if config.use_persistent_stores {
        let url = config
            .database_url
            .clone()
            .context("DATABASE_URL is required when USE_PERSISTENT_STORES is set")?;
        let store = PostgresJobStore::connect(&url, config.database_max_connections).await?;
        store.migrate().await.context("failed to apply jobs migration")?;
        info!("using Postgres job store");
        serve(listener, config, Arc::new(store)).await
    } else {
        warn!("using in-memory job store; jobs are lost on restart");
        serve(listener, config, InMemoryJobStore::arc()).await
    }
}

async fn serve<S: JobStore>(
    listener: TcpListener,
    config: ApiConfig,
    store: Arc<S>,
) -> anyhow::Result<()> {
    // Handlers for concrete job types are registered by the services that own them.
    let registry = HandlerRegistry::<S::Session>::new();
    let services = Arc::new(JobServices::new(store, registry, config.jobs.clone()));

    // Batches only claim handled types, so a worker with none would idle.
    let run_worker = config.run_worker && !services.handled_types().is_empty();
    if config.run_worker && !run_worker {
        warn!("no job handlers registered; background worker not started");
    }
    let worker = run_worker.then(|| services.worker().spawn());
    let app = app::build_app(&config, Arc::clone(&services));

    info!(addr = %listener.local_addr()?, worker = run_worker, "listening");

    let shutdown = services.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    Ok(())
}
