/// Public webhook endpoint
///
/// POST /webhooks/{token} captures the request (method, headers, query, body),
/// hands it to the ingestor and answers 202 right away. Callers never see the
/// execution outcome.

use crate::api::{api_error, ApiResult, AppState};
use crate::store::InboundPayload;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/{token}", post(receive_webhook))
}

/// Header names lowercased; non-UTF-8 values dropped
fn capture(method: &Method, headers: &HeaderMap, query: HashMap<String, String>, body: &[u8]) -> InboundPayload {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
    };

    InboundPayload {
        method: method.to_string(),
        headers,
        body,
        query,
    }
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    tracing::debug!("📥 Webhook request received for token {}", token);
    let payload = capture(&method, &headers, query, &body);
    let request_id = state
        .ingestor
        .ingest(&token, payload, &body)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "request_id": request_id }))))
}
