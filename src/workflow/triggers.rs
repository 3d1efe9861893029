/// Trigger synchronisation
///
/// Saving a workflow re-derives its Schedules (from `trigger_schedule` nodes)
/// and Webhooks (from `trigger_webhook` nodes). Rows whose definition didn't
/// change keep their identity, so a save never resets a schedule clock or
/// rotates a published webhook token.

use crate::error::EngineError;
use crate::store::{Schedule, Store, Webhook};
use crate::workflow::types::{NodeType, Workflow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Next fire time strictly after `after`, evaluated in `timezone`
///
/// Accepts 6/7-field expressions as-is and classic 5-field ones by prefixing a
/// zero seconds field.
pub fn next_fire(cron: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let expr = cron.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };

    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron '{cron}': {e}"))?;
    let tz: Tz = timezone
        .parse()
        .map_err(|e| format!("invalid timezone '{timezone}': {e}"))?;

    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("cron '{cron}' never fires again"))
}

fn str_param<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// Derive schedules from the workflow, reusing rows from `existing` where the
/// node's cron and timezone are unchanged.
pub fn derive_schedules(
    workflow: &Workflow,
    existing: &[Schedule],
    now: DateTime<Utc>,
) -> Result<Vec<Schedule>, EngineError> {
    let mut schedules = Vec::new();

    for node in workflow.nodes.iter().filter(|n| n.node_type == NodeType::TriggerSchedule) {
        let cron = str_param(&node.params, "cron")
            .ok_or_else(|| EngineError::invalid_config(&node.id, "missing required field 'cron'"))?;
        let timezone = str_param(&node.params, "timezone").unwrap_or(DEFAULT_TIMEZONE);

        let previous = existing
            .iter()
            .find(|s| s.node_id == node.id && s.cron == cron && s.timezone == timezone);

        let schedule = match previous {
            Some(prev) => Schedule {
                active: workflow.active,
                ..prev.clone()
            },
            None => Schedule {
                id: Uuid::new_v4(),
                workflow_id: workflow.id.clone(),
                node_id: node.id.clone(),
                cron: cron.to_string(),
                timezone: timezone.to_string(),
                next_run: next_fire(cron, timezone, now)
                    .map_err(|reason| EngineError::invalid_config(&node.id, reason))?,
                last_run: None,
                active: workflow.active,
            },
        };
        schedules.push(schedule);
    }

    Ok(schedules)
}

/// Derive webhooks from the workflow. Token precedence: explicit `token`
/// param, then the token already issued for this node, then a fresh UUID.
pub fn derive_webhooks(workflow: &Workflow, existing: &[Webhook]) -> Vec<Webhook> {
    workflow
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::TriggerWebhook)
        .map(|node| {
            let previous = existing.iter().find(|w| w.node_id == node.id);
            let token = str_param(&node.params, "token")
                .map(str::to_string)
                .or_else(|| previous.map(|w| w.token.clone()))
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

            Webhook {
                id: previous.map(|w| w.id).unwrap_or_else(Uuid::new_v4),
                token,
                secret: str_param(&node.params, "secret").map(str::to_string),
                workflow_id: workflow.id.clone(),
                node_id: node.id.clone(),
                active: workflow.active,
            }
        })
        .collect()
}

/// Re-derive and persist the trigger rows of `workflow`
pub async fn sync_triggers(store: &dyn Store, workflow: &Workflow) -> Result<(Vec<Schedule>, Vec<Webhook>), EngineError> {
    let existing_schedules = store.list_schedules(&workflow.id).await?;
    let schedules = derive_schedules(workflow, &existing_schedules, Utc::now())?;

    let existing_webhooks = store.list_webhooks(&workflow.id).await?;
    let webhooks = derive_webhooks(workflow, &existing_webhooks);

    store.replace_schedules(&workflow.id, &schedules).await?;
    store.replace_webhooks(&workflow.id, &webhooks).await?;

    info!(
        "🔁 Synced triggers for workflow {}: {} schedule(s), {} webhook(s)",
        workflow.id,
        schedules.len(),
        webhooks.len()
    );
    Ok((schedules, webhooks))
}
