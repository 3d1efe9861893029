/// Webhook ingestion
///
/// Accepts an inbound request for a public webhook token, checks its HMAC
/// signature when the webhook has a secret, persists it as a `received`
/// [`WebhookRequest`] and enqueues a `webhook` job. The execution itself runs
/// later on a worker; callers only get the request id back.

use crate::error::EngineError;
use crate::runtime::queue::{JobKind, JobQueue, WebhookJob};
use crate::store::{InboundPayload, Store, WebhookRequest, WebhookRequestStatus};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

/// Request header carrying the hex HMAC-SHA256 of the raw body, optionally
/// prefixed with `sha256=`
pub const SIGNATURE_HEADER: &str = "x-flowmesh-signature";

type HmacSha256 = Hmac<Sha256>;

/// Constant-time check of `signature` against HMAC-SHA256(`secret`, `body`)
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let hex_part = signature.trim();
    let hex_part = hex_part.strip_prefix("sha256=").unwrap_or(hex_part);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex signature for `body`, in the format [`verify_signature`] accepts
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn Store>,
    queue: JobQueue,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn Store>, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    /// Returns the id of the persisted [`WebhookRequest`].
    ///
    /// `raw_body` must be the exact bytes received; the signature is computed
    /// over them, not over the parsed payload.
    pub async fn ingest(&self, token: &str, payload: InboundPayload, raw_body: &[u8]) -> Result<Uuid, EngineError> {
        let webhook = match self.store.find_webhook_by_token(token).await? {
            Some(webhook) if webhook.active => webhook,
            _ => return Err(EngineError::NotFound(format!("webhook '{token}'"))),
        };

        if let Some(secret) = webhook.secret.as_deref().filter(|s| !s.is_empty()) {
            let signature = payload
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
                .map(|(_, value)| value.as_str());
            match signature {
                Some(signature) if verify_signature(secret, raw_body, signature) => {}
                Some(_) => {
                    tracing::warn!("🔐 Rejected webhook '{}': signature mismatch", webhook.id);
                    return Err(EngineError::Unauthorized("invalid signature".to_string()));
                }
                None => {
                    tracing::warn!("🔐 Rejected webhook '{}': missing signature", webhook.id);
                    return Err(EngineError::Unauthorized(format!("missing {SIGNATURE_HEADER} header")));
                }
            }
        }

        let request = WebhookRequest {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            status: WebhookRequestStatus::Received,
            payload: payload.clone(),
            execution_id: None,
            result: serde_json::Value::Null,
            error: None,
            received_at: Utc::now(),
        };
        self.store.create_webhook_request(&request).await?;
        self.queue.enqueue(JobKind::Webhook(WebhookJob {
            webhook_id: webhook.id,
            request_id: request.id,
            payload,
        }))?;

        tracing::info!(
            "📥 Webhook request {} accepted for workflow '{}' (node '{}')",
            request.id,
            webhook.workflow_id,
            webhook.node_id
        );
        Ok(request.id)
    }
}
