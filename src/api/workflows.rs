/// Workflow REST API endpoints
///
/// Saving a workflow validates it, persists it and re-derives its schedules and
/// webhooks. Manual runs go straight to the engine and return the execution id.

use crate::api::{api_error, user_id, ApiResult, AppState};
use crate::error::EngineError;
use crate::workflow::{triggers::sync_triggers, validate_workflow, Workflow};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
pub struct SavedWebhook {
    pub node_id: String,
    pub token: String,
}

/// Response for workflow save operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub schedules: usize,
    pub webhooks: Vec<SavedWebhook>,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}", get(get_workflow).put(save_workflow))
        .route("/api/workflows/{id}/execute", post(execute_workflow))
}

/// Create or replace a workflow
///
/// PUT /api/workflows/{id}
/// Body: { "id"?: "...", "name": "...", "nodes": [...], "edges": [...], "active"?: true }
async fn save_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(mut workflow): Json<Workflow>,
) -> ApiResult<Json<WorkflowResponse>> {
    if workflow.id.is_empty() {
        workflow.id = id.clone();
    }
    if workflow.id != id {
        return Err(api_error(EngineError::malformed(
            "-",
            format!("body id '{}' does not match path id '{}'", workflow.id, id),
        )));
    }
    if workflow.user_id.is_empty() {
        workflow.user_id = user_id(&headers).unwrap_or_default();
    }

    validate_workflow(&workflow).map_err(api_error)?;
    state.store.save_workflow(&workflow).await.map_err(api_error)?;
    let (schedules, webhooks) = sync_triggers(state.store.as_ref(), &workflow)
        .await
        .map_err(api_error)?;

    tracing::info!("🔥 Saved workflow '{}' ({} nodes)", workflow.id, workflow.nodes.len());

    Ok(Json(WorkflowResponse {
        id: workflow.id,
        schedules: schedules.len(),
        webhooks: webhooks
            .into_iter()
            .map(|w| SavedWebhook { node_id: w.node_id, token: w.token })
            .collect(),
    }))
}

/// GET /api/workflows/{id}
async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Workflow>> {
    match state.store.get_workflow(&id).await.map_err(api_error)? {
        Some(workflow) => Ok(Json(workflow)),
        None => Err(api_error(EngineError::NotFound(format!("workflow '{id}'")))),
    }
}

/// Start a manual run
///
/// POST /api/workflows/{id}/execute
/// Body: optional JSON seed, exposed to templates as `trigger`
async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let seed = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("invalid JSON body: {e}") })))
        })?
    };

    let workflow = state
        .store
        .get_workflow(&id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(EngineError::NotFound(format!("workflow '{id}'"))))?;
    let owner = user_id(&headers).unwrap_or_else(|| workflow.user_id.clone());

    let execution_id = state.engine.execute(workflow, seed, &owner).await.map_err(api_error)?;
    tracing::info!("🚀 Manual run of '{}' started as execution {}", id, execution_id);

    Ok((StatusCode::ACCEPTED, Json(json!({ "execution_id": execution_id }))))
}
