/// Persistence layer
///
/// The engine only talks to the [`Store`] trait. Two implementations ship:
/// - [`SqliteStore`]: sqlx/SQLite, JSON stored as TEXT, used by the server
/// - [`InMemoryStore`]: lock-guarded maps, used by tests and embedders
///
/// Every conditional update the engine relies on (terminal-once executions,
/// schedule claim-and-advance, forward-only webhook requests) is a single
/// atomic operation in both backends.

pub mod memory;
pub mod models;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use models::{
    Execution, ExecutionLog, ExecutionStatus, InboundPayload, LogLevel, Schedule, Webhook,
    WebhookRequest, WebhookRequestStatus,
};
pub use sqlite::SqliteStore;

use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored row could not be mapped back into a model
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // ------ Workflows ------

    async fn save_workflow(&self, workflow: &Workflow) -> StoreResult<()>;

    async fn get_workflow(&self, id: &str) -> StoreResult<Option<Workflow>>;

    // ------ Executions ------

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>>;

    /// Move a RUNNING execution to a terminal status. Returns `false` (and
    /// changes nothing) when the execution is already terminal or unknown.
    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Value,
        error: Option<String>,
    ) -> StoreResult<bool>;

    /// Most recent first
    async fn list_executions(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Execution>>;

    // ------ Execution logs ------

    async fn append_log(&self, entry: &ExecutionLog) -> StoreResult<()>;

    /// In append order
    async fn list_logs(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionLog>>;

    // ------ Schedules ------

    async fn list_schedules(&self, workflow_id: &str) -> StoreResult<Vec<Schedule>>;

    /// Replace every schedule of `workflow_id` with `schedules`
    async fn replace_schedules(&self, workflow_id: &str, schedules: &[Schedule]) -> StoreResult<()>;

    /// Active schedules with `next_run <= now`
    async fn due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>>;

    /// Atomic claim-and-advance: succeeds only if `next_run` still equals
    /// `expected_next_run`, so concurrent scheduler instances can't double-fire.
    async fn claim_schedule(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // ------ Webhooks ------

    async fn list_webhooks(&self, workflow_id: &str) -> StoreResult<Vec<Webhook>>;

    async fn replace_webhooks(&self, workflow_id: &str, webhooks: &[Webhook]) -> StoreResult<()>;

    async fn find_webhook_by_token(&self, token: &str) -> StoreResult<Option<Webhook>>;

    async fn get_webhook(&self, id: Uuid) -> StoreResult<Option<Webhook>>;

    async fn create_webhook_request(&self, request: &WebhookRequest) -> StoreResult<()>;

    async fn get_webhook_request(&self, id: Uuid) -> StoreResult<Option<WebhookRequest>>;

    /// Forward-only status move; returns `false` if the transition isn't allowed
    /// from the current status. `execution_id`, `result` and `error` are only
    /// written when `Some`.
    async fn advance_webhook_request(
        &self,
        id: Uuid,
        status: WebhookRequestStatus,
        execution_id: Option<Uuid>,
        result: Option<Value>,
        error: Option<String>,
    ) -> StoreResult<bool>;
}
