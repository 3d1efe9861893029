/// HTTP API Layer
///
/// REST endpoints around the engine:
/// - Workflow save/get (with trigger synchronisation) and manual runs
/// - Execution queries, logs and administrative abort
/// - Public webhook ingestion

// Workflow save/get/execute endpoints
pub mod workflows;

// Execution query and abort endpoints
pub mod executions;

// Public webhook endpoint
pub mod webhooks;

use crate::error::EngineError;
use crate::runtime::{ExecutionEngine, WebhookIngestor};
use crate::store::Store;
use axum::{
    http::{HeaderMap, StatusCode},
    response::Json,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub use executions::create_execution_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::create_workflow_routes;

/// Header identifying the calling user (authentication happens upstream)
pub const USER_HEADER: &str = "x-user-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<ExecutionEngine>,
    pub ingestor: WebhookIngestor,
}

pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::MalformedGraph { .. } | EngineError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{ "error": "<message>" }` with the mapped status
pub fn api_error(err: impl Into<EngineError>) -> ApiError {
    let err = err.into();
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!("❌ Request failed: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() })))
}

pub(crate) fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Every API route, state applied
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(create_workflow_routes())
        .merge(create_execution_routes())
        .merge(create_webhook_routes())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&EngineError::malformed("n", "bad")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&EngineError::invalid_config("n", "bad")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&EngineError::Unauthorized("sig".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&EngineError::NotFound("wf".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&EngineError::QueueClosed), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn blank_user_header_is_ignored() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), None);
        headers.insert(USER_HEADER, "  ".parse().unwrap());
        assert_eq!(user_id(&headers), None);
        headers.insert(USER_HEADER, "u-42".parse().unwrap());
        assert_eq!(user_id(&headers).as_deref(), Some("u-42"));
    }
}
