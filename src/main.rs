/// flowmesh server entry point
///
/// Serves:
/// - Workflow API at /api/workflows/*
/// - Execution API at /api/executions/*
/// - Webhook ingestion at /webhooks/{token}
/// - Health check at /healthz

use flowmesh::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration comes from FLOWMESH_* environment variables
    let config = Config::default();

    start_server(config).await
}
