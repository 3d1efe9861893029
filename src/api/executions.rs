/// Execution query and administration endpoints
///
/// Reads are scoped to the caller's `x-user-id`; another user's execution is
/// reported as not found.

use crate::api::{api_error, user_id, ApiResult, AppState};
use crate::error::EngineError;
use crate::store::{Execution, ExecutionLog};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/logs", get(get_logs))
        .route("/api/executions/{id}/abort", post(abort_execution))
}

fn caller(headers: &HeaderMap) -> ApiResult<String> {
    user_id(headers).ok_or_else(|| api_error(EngineError::Unauthorized("missing x-user-id header".to_string())))
}

async fn owned_execution(state: &AppState, headers: &HeaderMap, id: Uuid) -> ApiResult<Execution> {
    let user = caller(headers)?;
    match state.store.get_execution(id).await.map_err(api_error)? {
        Some(execution) if execution.user_id == user => Ok(execution),
        _ => Err(api_error(EngineError::NotFound(format!("execution {id}")))),
    }
}

/// GET /api/executions?limit=50 (most recent first)
async fn list_executions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let user = caller(&headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let executions = state.store.list_executions(&user, limit).await.map_err(api_error)?;
    Ok(Json(json!({ "executions": executions })))
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Execution>> {
    owned_execution(&state, &headers, id).await.map(Json)
}

/// GET /api/executions/{id}/logs (append order)
async fn get_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ExecutionLog>>> {
    owned_execution(&state, &headers, id).await?;
    let logs = state.store.list_logs(id).await.map_err(api_error)?;
    Ok(Json(logs))
}

/// POST /api/executions/{id}/abort
///
/// Returns `{ "aborted": false }` when the execution had already finished.
async fn abort_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    owned_execution(&state, &headers, id).await?;
    let aborted = state.engine.abort(id).await.map_err(api_error)?;
    Ok(Json(json!({ "execution_id": id, "aborted": aborted })))
}
