/// Persisted entity definitions
///
/// Field semantics follow the engine's contract with the store: executions are
/// terminal-once, logs are append-only, schedules advance by compare-and-set and
/// webhook requests only move forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(ExecutionStatus::Running),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "FAILED" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// One run of a workflow snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Leaf outputs plus any branch failures, written once at the terminal transition
    pub result: Value,
    pub error: Option<String>,
    /// Set when started by a sub_workflow node
    pub parent_execution_id: Option<Uuid>,
}

impl Execution {
    pub fn started(workflow_id: &str, user_id: &str, parent: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: Value::Null,
            error: None,
            parent_execution_id: parent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Append-only, user-visible record of what the engine did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub execution_id: Uuid,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Cron schedule derived from a `trigger_schedule` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub workflow_id: String,
    /// The trigger node execution starts from
    pub node_id: String,
    pub cron: String,
    pub timezone: String,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

/// Public entry point derived from a `trigger_webhook` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    /// Public, unique url token (`POST /webhooks/{token}`)
    pub token: String,
    /// HMAC-SHA256 shared secret; when set, requests must be signed
    pub secret: Option<String>,
    pub workflow_id: String,
    pub node_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookRequestStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl WebhookRequestStatus {
    /// Forward-only: received -> processing -> {completed | failed}
    pub fn can_advance_to(self, next: WebhookRequestStatus) -> bool {
        use WebhookRequestStatus::*;
        matches!(
            (self, next),
            (Received, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WebhookRequestStatus::Received => "received",
            WebhookRequestStatus::Processing => "processing",
            WebhookRequestStatus::Completed => "completed",
            WebhookRequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(WebhookRequestStatus::Received),
            "processing" => Some(WebhookRequestStatus::Processing),
            "completed" => Some(WebhookRequestStatus::Completed),
            "failed" => Some(WebhookRequestStatus::Failed),
            _ => None,
        }
    }
}

/// The captured inbound HTTP request; becomes the execution's seed data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundPayload {
    pub method: String,
    pub headers: HashMap<String, String>,
    /// JSON body if it parsed, otherwise the raw text
    pub body: Value,
    pub query: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub status: WebhookRequestStatus,
    pub payload: InboundPayload,
    pub execution_id: Option<Uuid>,
    /// Final `{outputs, failures}` of the execution this request started
    #[serde(default)]
    pub result: Value,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}
