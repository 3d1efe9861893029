/// Engine-backed job processor
///
/// Turns queue jobs into engine calls. Returning an error makes the queue
/// redeliver the job, so every step here is safe to repeat.

use crate::error::EngineError;
use crate::runtime::engine::{ExecutionEngine, ExecutionRequest};
use crate::runtime::queue::{Job, JobKind, JobProcessor, WebhookJob};
use crate::store::{ExecutionStatus, WebhookRequestStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub struct WorkflowJobProcessor {
    engine: Arc<ExecutionEngine>,
}

impl WorkflowJobProcessor {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    async fn run_webhook(&self, job: &WebhookJob) -> Result<()> {
        let store = Arc::clone(self.engine.store());

        let Some(request) = store.get_webhook_request(job.request_id).await? else {
            tracing::warn!("⚠️ Webhook request {} vanished before processing", job.request_id);
            return Ok(());
        };
        match request.status {
            WebhookRequestStatus::Received => {
                store
                    .advance_webhook_request(request.id, WebhookRequestStatus::Processing, None, None, None)
                    .await?;
            }
            WebhookRequestStatus::Processing => {}
            WebhookRequestStatus::Completed | WebhookRequestStatus::Failed => return Ok(()),
        }

        let webhook = store
            .get_webhook(job.webhook_id)
            .await?
            .with_context(|| format!("webhook {} not found", job.webhook_id))?;
        let workflow = match store.get_workflow(&webhook.workflow_id).await? {
            Some(workflow) if workflow.active => workflow,
            _ => {
                let reason = format!("workflow '{}' is missing or inactive", webhook.workflow_id);
                store
                    .advance_webhook_request(request.id, WebhookRequestStatus::Failed, None, None, Some(reason))
                    .await?;
                return Ok(());
            }
        };

        let seed = serde_json::to_value(&job.payload)?;
        let owner = workflow.user_id.clone();
        let request_id = request.id;
        let started = self
            .engine
            .begin(ExecutionRequest::new(workflow, seed).owned_by(owner).starting_at(&webhook.node_id))
            .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                store
                    .advance_webhook_request(request_id, WebhookRequestStatus::Failed, None, None, Some(e.to_string()))
                    .await?;
                tracing::warn!("⚠️ Webhook request {} could not start: {}", request_id, e);
                return Ok(());
            }
        };

        let execution_id = handle.id;
        tracing::info!("🪝 Webhook request {} started execution {}", request_id, execution_id);

        // Close the request out once the execution is terminal
        tokio::spawn(async move {
            let status = handle.finished().await.unwrap_or(ExecutionStatus::Failed);
            let execution = match store.get_execution(execution_id).await {
                Ok(execution) => execution,
                Err(e) => {
                    tracing::warn!("⚠️ Could not read execution {} for webhook request {}: {}", execution_id, request_id, e);
                    None
                }
            };
            let (result, reason) = match execution {
                Some(execution) => (Some(execution.result), execution.error),
                None => (None, None),
            };
            let (next, error) = match status {
                ExecutionStatus::Completed => (WebhookRequestStatus::Completed, None),
                _ => (
                    WebhookRequestStatus::Failed,
                    Some(reason.unwrap_or_else(|| format!("execution {execution_id} failed"))),
                ),
            };
            if let Err(e) = store
                .advance_webhook_request(request_id, next, Some(execution_id), result, error)
                .await
            {
                tracing::error!("❌ Could not close webhook request {}: {}", request_id, e);
            }
        });
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for WorkflowJobProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        match &job.kind {
            JobKind::Execute(request) => match self.engine.begin(request.clone()).await {
                Ok(handle) => tracing::debug!("▶️ Job {} started execution {}", job.id, handle.id),
                Err(e @ EngineError::Store(_)) => return Err(e.into()),
                // Redelivery can't fix a bad graph
                Err(e) => tracing::warn!("⚠️ Job {} rejected for workflow '{}': {}", job.id, request.workflow.id, e),
            },
            JobKind::Continue(continuation) => self.engine.resume(continuation.clone()).await?,
            JobKind::Webhook(webhook) => self.run_webhook(webhook).await?,
        }
        Ok(())
    }

    async fn abandon(&self, job: &Job, error: &str) {
        match &job.kind {
            JobKind::Execute(request) => {
                tracing::error!("❌ Execution of workflow '{}' was never started: {}", request.workflow.id, error);
            }
            JobKind::Continue(continuation) => {
                if let Err(e) = self.engine.abandon(continuation.execution_id, error).await {
                    tracing::error!("❌ Could not fail execution {}: {}", continuation.execution_id, e);
                }
            }
            JobKind::Webhook(webhook) => {
                let store = self.engine.store();
                // Received -> Processing -> Failed; a request already past Received skips the first hop
                let _ = store
                    .advance_webhook_request(webhook.request_id, WebhookRequestStatus::Processing, None, None, None)
                    .await;
                if let Err(e) = store
                    .advance_webhook_request(
                        webhook.request_id,
                        WebhookRequestStatus::Failed,
                        None,
                        None,
                        Some(error.to_string()),
                    )
                    .await
                {
                    tracing::error!("❌ Could not fail webhook request {}: {}", webhook.request_id, e);
                }
            }
        }
    }
}
