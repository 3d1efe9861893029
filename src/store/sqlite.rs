/// SQLite persistence layer
///
/// Workflows, execution results and webhook payloads are stored as JSON text;
/// timestamps are stored as unix milliseconds so range queries (`due_schedules`)
/// stay plain integer comparisons. Conditional updates are single `UPDATE ...
/// WHERE` statements and report success through `rows_affected`.

use crate::store::models::*;
use crate::store::{Store, StoreError, StoreResult};
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// SQLite connection pool
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create new store instance over an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and initialise the schema
    ///
    /// In-memory URLs get a single connection that is never recycled; every
    /// SQLite connection would otherwise see its own empty database.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 8 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create all tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                definition TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                result TEXT NOT NULL,
                error TEXT,
                parent_execution_id TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_executions_user ON executions(user_id, started_at)",
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs(execution_id, seq)",
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                cron TEXT NOT NULL,
                timezone TEXT NOT NULL,
                next_run INTEGER NOT NULL,
                last_run INTEGER,
                active INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(active, next_run)",
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL UNIQUE,
                secret TEXT,
                workflow_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                active INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhook_requests (
                id TEXT PRIMARY KEY,
                webhook_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                execution_id TEXT,
                result TEXT NOT NULL DEFAULT 'null',
                error TEXT,
                received_at INTEGER NOT NULL
            )
            "#,
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {ms}")))
}

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid '{s}': {e}")))
}

fn row_to_execution(row: &SqliteRow) -> StoreResult<Execution> {
    let status: String = row.get("status");
    let result: String = row.get("result");
    let finished_at: Option<i64> = row.get("finished_at");
    let parent: Option<String> = row.get("parent_execution_id");
    Ok(Execution {
        id: parse_uuid(row.get::<&str, _>("id"))?,
        workflow_id: row.get("workflow_id"),
        user_id: row.get("user_id"),
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("bad execution status '{status}'")))?,
        started_at: from_millis(row.get("started_at"))?,
        finished_at: finished_at.map(from_millis).transpose()?,
        result: serde_json::from_str(&result)?,
        error: row.get("error"),
        parent_execution_id: parent.as_deref().map(parse_uuid).transpose()?,
    })
}

fn row_to_log(row: &SqliteRow) -> StoreResult<ExecutionLog> {
    let level: String = row.get("level");
    Ok(ExecutionLog {
        execution_id: parse_uuid(row.get::<&str, _>("execution_id"))?,
        node_id: row.get("node_id"),
        timestamp: from_millis(row.get("timestamp"))?,
        level: LogLevel::parse(&level).ok_or_else(|| StoreError::Corrupt(format!("bad log level '{level}'")))?,
        message: row.get("message"),
    })
}

fn row_to_schedule(row: &SqliteRow) -> StoreResult<Schedule> {
    let last_run: Option<i64> = row.get("last_run");
    Ok(Schedule {
        id: parse_uuid(row.get::<&str, _>("id"))?,
        workflow_id: row.get("workflow_id"),
        node_id: row.get("node_id"),
        cron: row.get("cron"),
        timezone: row.get("timezone"),
        next_run: from_millis(row.get("next_run"))?,
        last_run: last_run.map(from_millis).transpose()?,
        active: row.get("active"),
    })
}

fn row_to_webhook(row: &SqliteRow) -> StoreResult<Webhook> {
    Ok(Webhook {
        id: parse_uuid(row.get::<&str, _>("id"))?,
        token: row.get("token"),
        secret: row.get("secret"),
        workflow_id: row.get("workflow_id"),
        node_id: row.get("node_id"),
        active: row.get("active"),
    })
}

fn row_to_webhook_request(row: &SqliteRow) -> StoreResult<WebhookRequest> {
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let execution_id: Option<String> = row.get("execution_id");
    let result: String = row.get("result");
    Ok(WebhookRequest {
        id: parse_uuid(row.get::<&str, _>("id"))?,
        webhook_id: parse_uuid(row.get::<&str, _>("webhook_id"))?,
        status: WebhookRequestStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("bad webhook request status '{status}'")))?,
        payload: serde_json::from_str(&payload)?,
        execution_id: execution_id.as_deref().map(parse_uuid).transpose()?,
        result: serde_json::from_str(&result)?,
        error: row.get("error"),
        received_at: from_millis(row.get("received_at"))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        let definition = serde_json::to_string(workflow)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, user_id, definition, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                user_id = excluded.user_id,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.user_id)
        .bind(&definition)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_id, user_id, status, started_at, finished_at, result, error, parent_execution_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(&execution.user_id)
        .bind(execution.status.as_str())
        .bind(millis(execution.started_at))
        .bind(execution.finished_at.map(millis))
        .bind(serde_json::to_string(&execution.result)?)
        .bind(&execution.error)
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Value,
        error: Option<String>,
    ) -> StoreResult<bool> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let outcome = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, result = ?, error = ?, finished_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(&result)?)
        .bind(error)
        .bind(millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn list_executions(&self, user_id: &str, limit: usize) -> StoreResult<Vec<Execution>> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE user_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn append_log(&self, entry: &ExecutionLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (execution_id, node_id, timestamp, level, message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.execution_id.to_string())
        .bind(&entry.node_id)
        .bind(millis(entry.timestamp))
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionLog>> {
        let rows = sqlx::query("SELECT * FROM execution_logs WHERE execution_id = ? ORDER BY seq ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log).collect()
    }

    async fn list_schedules(&self, workflow_id: &str) -> StoreResult<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn replace_schedules(&self, workflow_id: &str, schedules: &[Schedule]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM schedules WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        for s in schedules {
            sqlx::query(
                r#"
                INSERT INTO schedules (id, workflow_id, node_id, cron, timezone, next_run, last_run, active)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(s.id.to_string())
            .bind(&s.workflow_id)
            .bind(&s.node_id)
            .bind(&s.cron)
            .bind(&s.timezone)
            .bind(millis(s.next_run))
            .bind(s.last_run.map(millis))
            .bind(s.active)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE active = 1 AND next_run <= ? ORDER BY next_run ASC",
        )
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn claim_schedule(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let outcome = sqlx::query(
            "UPDATE schedules SET last_run = ?, next_run = ? WHERE id = ? AND next_run = ?",
        )
        .bind(millis(last_run))
        .bind(millis(next_run))
        .bind(id.to_string())
        .bind(millis(expected_next_run))
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }

    async fn list_webhooks(&self, workflow_id: &str) -> StoreResult<Vec<Webhook>> {
        let rows = sqlx::query("SELECT * FROM webhooks WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_webhook).collect()
    }

    async fn replace_webhooks(&self, workflow_id: &str, webhooks: &[Webhook]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM webhooks WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        for w in webhooks {
            sqlx::query(
                r#"
                INSERT INTO webhooks (id, token, secret, workflow_id, node_id, active)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(w.id.to_string())
            .bind(&w.token)
            .bind(&w.secret)
            .bind(&w.workflow_id)
            .bind(&w.node_id)
            .bind(w.active)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_webhook_by_token(&self, token: &str) -> StoreResult<Option<Webhook>> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_webhook).transpose()
    }

    async fn get_webhook(&self, id: Uuid) -> StoreResult<Option<Webhook>> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_webhook).transpose()
    }

    async fn create_webhook_request(&self, request: &WebhookRequest) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_requests (id, webhook_id, status, payload, execution_id, result, error, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.to_string())
        .bind(request.webhook_id.to_string())
        .bind(request.status.as_str())
        .bind(serde_json::to_string(&request.payload)?)
        .bind(request.execution_id.map(|id| id.to_string()))
        .bind(serde_json::to_string(&request.result)?)
        .bind(&request.error)
        .bind(millis(request.received_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_request(&self, id: Uuid) -> StoreResult<Option<WebhookRequest>> {
        let row = sqlx::query("SELECT * FROM webhook_requests WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_webhook_request).transpose()
    }

    async fn advance_webhook_request(
        &self,
        id: Uuid,
        status: WebhookRequestStatus,
        execution_id: Option<Uuid>,
        result: Option<Value>,
        error: Option<String>,
    ) -> StoreResult<bool> {
        use WebhookRequestStatus::*;
        // Each target status has exactly one legal predecessor
        let Some(from) = [Received, Processing, Completed, Failed]
            .into_iter()
            .find(|s| s.can_advance_to(status))
        else {
            return Ok(false);
        };

        let outcome = sqlx::query(
            r#"
            UPDATE webhook_requests
            SET status = ?,
                execution_id = COALESCE(?, execution_id),
                result = COALESCE(?, result),
                error = COALESCE(?, error)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(execution_id.map(|id| id.to_string()))
        .bind(result.map(|r| serde_json::to_string(&r)).transpose()?)
        .bind(error)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Node, NodeType};
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn workflow_round_trips_through_json_column() {
        let store = store().await;
        let wf = Workflow {
            id: "wf-1".into(),
            name: "demo".into(),
            user_id: "u1".into(),
            nodes: vec![Node::new("t", NodeType::TriggerManual, json!({}))],
            edges: vec![],
            active: true,
        };
        store.save_workflow(&wf).await.unwrap();
        assert_eq!(store.get_workflow("wf-1").await.unwrap(), Some(wf));
        assert_eq!(store.get_workflow("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn finish_execution_only_once() {
        let store = store().await;
        let exec = Execution::started("wf", "u1", None);
        store.create_execution(&exec).await.unwrap();

        assert!(store
            .finish_execution(exec.id, ExecutionStatus::Completed, json!({ "outputs": {} }), None)
            .await
            .unwrap());
        assert!(!store
            .finish_execution(exec.id, ExecutionStatus::Failed, Value::Null, Some("late".into()))
            .await
            .unwrap());

        let stored = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.finished_at.is_some());
        assert_eq!(store.list_executions("u1", 10).await.unwrap().len(), 1);
        assert!(store.list_executions("someone-else", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn logs_keep_append_order() {
        let store = store().await;
        let id = Uuid::new_v4();
        let ts = Utc::now();
        for node in ["a", "b", "c"] {
            store
                .append_log(&ExecutionLog {
                    execution_id: id,
                    node_id: node.into(),
                    timestamp: ts,
                    level: LogLevel::Info,
                    message: format!("{node} done"),
                })
                .await
                .unwrap();
        }
        let nodes: Vec<String> = store.list_logs(id).await.unwrap().into_iter().map(|l| l.node_id).collect();
        assert_eq!(nodes, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn schedule_claim_and_advance() {
        let store = store().await;
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            node_id: "cron".into(),
            cron: "0 * * * * *".into(),
            timezone: "UTC".into(),
            next_run: now - Duration::seconds(5),
            last_run: None,
            active: true,
        };
        store.replace_schedules("wf", &[schedule.clone()]).await.unwrap();
        assert_eq!(store.due_schedules(now).await.unwrap().len(), 1);

        let next = now + Duration::seconds(55);
        assert!(store.claim_schedule(schedule.id, schedule.next_run, now, next).await.unwrap());
        assert!(!store.claim_schedule(schedule.id, schedule.next_run, now, next).await.unwrap());

        let stored = store.list_schedules("wf").await.unwrap().remove(0);
        assert_eq!(stored.next_run, next);
        assert_eq!(stored.last_run, Some(now));
        assert!(store.due_schedules(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_request_moves_forward_only() {
        let store = store().await;
        let webhook = Webhook {
            id: Uuid::new_v4(),
            token: "tok".into(),
            secret: None,
            workflow_id: "wf".into(),
            node_id: "hook".into(),
            active: true,
        };
        store.replace_webhooks("wf", &[webhook.clone()]).await.unwrap();
        assert_eq!(store.find_webhook_by_token("tok").await.unwrap(), Some(webhook.clone()));

        let request = WebhookRequest {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            status: WebhookRequestStatus::Received,
            payload: InboundPayload {
                method: "POST".into(),
                body: json!({ "a": 1 }),
                ..Default::default()
            },
            execution_id: None,
            result: Value::Null,
            error: None,
            received_at: Utc::now(),
        };
        store.create_webhook_request(&request).await.unwrap();

        let exec_id = Uuid::new_v4();
        assert!(!store
            .advance_webhook_request(request.id, WebhookRequestStatus::Completed, None, Some(json!({ "outputs": { "done": 1 } })), None)
            .await
            .unwrap());
        assert!(store
            .advance_webhook_request(request.id, WebhookRequestStatus::Processing, Some(exec_id), None, None)
            .await
            .unwrap());
        assert!(store
            .advance_webhook_request(request.id, WebhookRequestStatus::Completed, None, Some(json!({ "outputs": { "done": 2 } })), None)
            .await
            .unwrap());
        assert!(!store
            .advance_webhook_request(request.id, WebhookRequestStatus::Processing, None, None, None)
            .await
            .unwrap());

        let stored = store.get_webhook_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WebhookRequestStatus::Completed);
        assert_eq!(stored.execution_id, Some(exec_id));
        assert_eq!(stored.result, json!({ "outputs": { "done": 2 } }));
        assert_eq!(stored.payload.body, json!({ "a": 1 }));
    }
}
