/// Server setup and initialization
///
/// Wires together all components: store, breakers, dispatch registry, job queue,
/// worker pool, execution engine, cron scheduler and HTTP routes.

use crate::{
    api::{create_router, AppState},
    config::Config,
    nodes::default_registry,
    runtime::{
        BreakerRegistry, ExecutionEngine, JobQueue, Scheduler, SchedulerService, WebhookIngestor, WorkerPool,
        WorkflowJobProcessor,
    },
    store::{SqliteStore, Store},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Running application: the router plus the background services it depends on
pub struct App {
    pub router: Router,
    pub engine: Arc<ExecutionEngine>,
    pub workers: WorkerPool,
    pub scheduler: Arc<SchedulerService>,
}

impl App {
    /// Stop the scheduler and the workers. Returns how many executions still
    /// had live branches; they stay RUNNING in the store.
    pub async fn shutdown(self) -> Result<usize> {
        self.scheduler.stop().await?;
        let unfinished = self.engine.active_runs().await;
        if unfinished > 0 {
            tracing::warn!("⚠️ Shutting down with {} execution(s) still running", unfinished);
        }
        self.workers.shutdown();
        Ok(unfinished)
    }
}

/// Directory of a file-backed sqlite url, if any
fn sqlite_data_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    let path = path.split('?').next().unwrap_or(path);
    Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
}

/// Build every component and the Axum router on top of `store`
pub async fn create_app_with_store(config: &Config, store: Arc<dyn Store>) -> Result<App> {
    tracing::info!("🛡️ Initializing circuit breakers");
    let breakers = Arc::new(BreakerRegistry::new(config.breaker));

    tracing::info!("🧩 Registering node handlers");
    let dispatch = Arc::new(default_registry(&config.integrations, breakers)?);

    tracing::info!("🚀 Initializing execution engine");
    let (queue, receiver) = JobQueue::new();
    let engine = Arc::new(ExecutionEngine::new(
        Arc::clone(&store),
        dispatch,
        queue.clone(),
        config.engine,
    ));
    let workers = WorkerPool::start(
        receiver,
        queue.clone(),
        Arc::new(WorkflowJobProcessor::new(Arc::clone(&engine))),
        config.queue,
    );

    tracing::info!("⏰ Initializing cron scheduler service");
    let scheduler = Arc::new(
        SchedulerService::new(
            Scheduler::new(Arc::clone(&store), queue.clone()),
            Duration::from_secs(config.scheduler.tick_secs.max(1)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );
    scheduler.start().await?;

    let state = AppState {
        store: Arc::clone(&store),
        engine: Arc::clone(&engine),
        ingestor: WebhookIngestor::new(store, queue),
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_router(state));

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        router,
        engine,
        workers,
        scheduler,
    })
}

/// Connect the configured sqlite database and build the application
pub async fn create_app(config: &Config) -> Result<App> {
    if let Some(dir) = sqlite_data_dir(&config.database.url) {
        tracing::info!("📁 Ensuring data directory exists: {}", dir.display());
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;
    }

    tracing::info!("📋 Connecting to {}", config.database.url);
    let store = SqliteStore::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    create_app_with_store(config, Arc::new(store)).await
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowmesh server...");

    let app = create_app(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.clone().into_make_service()).await?;

    app.shutdown().await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_only_for_file_urls() {
        assert_eq!(sqlite_data_dir("sqlite://data/flowmesh.db"), Some(Path::new("data")));
        assert_eq!(sqlite_data_dir("sqlite:/var/lib/fm/db.sqlite?mode=rwc"), Some(Path::new("/var/lib/fm")));
        assert_eq!(sqlite_data_dir("sqlite::memory:"), None);
        assert_eq!(sqlite_data_dir("sqlite://flowmesh.db"), None);
    }
}
