/// In-memory store
///
/// All state sits behind one tokio `RwLock`, so each trait method is a single
/// atomic step with respect to every other caller.

use crate::store::models::*;
use crate::store::{Store, StoreResult};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    workflows: HashMap<String, Workflow>,
    executions: HashMap<Uuid, Execution>,
    logs: HashMap<Uuid, Vec<ExecutionLog>>,
    schedules: HashMap<Uuid, Schedule>,
    webhooks: HashMap<Uuid, Webhook>,
    webhook_requests: HashMap<Uuid, WebhookRequest>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> StoreResult<Option<Workflow>> {
        Ok(self.tables.read().await.workflows.get(id).cloned())
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        Ok(self.tables.read().await.executions.get(&id).cloned())
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Value,
        error: Option<String>,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        match t.executions.get_mut(&id) {
            Some(exec) if !exec.status.is_terminal() && status.is_terminal() => {
                exec.status = status;
                exec.result = result;
                exec.error = error;
                exec.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_executions(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Execution>> {
        let t = self.tables.read().await;
        let mut list: Vec<Execution> = t
            .executions
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list.truncate(limit);
        Ok(list)
    }

    async fn append_log(&self, entry: &ExecutionLog) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.logs.entry(entry.execution_id).or_default().push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionLog>> {
        Ok(self
            .tables
            .read()
            .await
            .logs
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_schedules(&self, workflow_id: &str) -> StoreResult<Vec<Schedule>> {
        let t = self.tables.read().await;
        Ok(t.schedules
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn replace_schedules(&self, workflow_id: &str, schedules: &[Schedule]) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.schedules.retain(|_, s| s.workflow_id != workflow_id);
        for schedule in schedules {
            t.schedules.insert(schedule.id, schedule.clone());
        }
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let t = self.tables.read().await;
        let mut due: Vec<Schedule> = t
            .schedules
            .values()
            .filter(|s| s.active && s.next_run <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run);
        Ok(due)
    }

    async fn claim_schedule(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        match t.schedules.get_mut(&id) {
            Some(s) if s.next_run == expected_next_run => {
                s.last_run = Some(last_run);
                s.next_run = next_run;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_webhooks(&self, workflow_id: &str) -> StoreResult<Vec<Webhook>> {
        let t = self.tables.read().await;
        Ok(t.webhooks
            .values()
            .filter(|w| w.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn replace_webhooks(&self, workflow_id: &str, webhooks: &[Webhook]) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.webhooks.retain(|_, w| w.workflow_id != workflow_id);
        for webhook in webhooks {
            t.webhooks.insert(webhook.id, webhook.clone());
        }
        Ok(())
    }

    async fn find_webhook_by_token(&self, token: &str) -> StoreResult<Option<Webhook>> {
        let t = self.tables.read().await;
        Ok(t.webhooks.values().find(|w| w.token == token).cloned())
    }

    async fn get_webhook(&self, id: Uuid) -> StoreResult<Option<Webhook>> {
        Ok(self.tables.read().await.webhooks.get(&id).cloned())
    }

    async fn create_webhook_request(&self, request: &WebhookRequest) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.webhook_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_webhook_request(&self, id: Uuid) -> StoreResult<Option<WebhookRequest>> {
        Ok(self.tables.read().await.webhook_requests.get(&id).cloned())
    }

    async fn advance_webhook_request(
        &self,
        id: Uuid,
        status: WebhookRequestStatus,
        execution_id: Option<Uuid>,
        result: Option<Value>,
        error: Option<String>,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        match t.webhook_requests.get_mut(&id) {
            Some(req) if req.status.can_advance_to(status) => {
                req.status = status;
                if execution_id.is_some() {
                    req.execution_id = execution_id;
                }
                if let Some(result) = result {
                    req.result = result;
                }
                if error.is_some() {
                    req.error = error;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
