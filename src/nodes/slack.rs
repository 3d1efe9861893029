/// `slack_send`: posts `{ channel, text }` through `chat.postMessage`
use crate::runtime::dispatch::NodeHandler;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const SLACK_API: &str = "https://slack.com/api";

pub struct SlackHandler {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl SlackHandler {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Slack client")?;
        Ok(Self {
            client,
            token: token.into(),
            base_url: SLACK_API.to_string(),
        })
    }

    /// Point at a different API root (self-hosted proxy, test server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl NodeHandler for SlackHandler {
    async fn execute(&self, params: &Value, _context: &Value) -> Result<Value> {
        let channel = params
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("slack_send missing 'channel'"))?;
        let text = match params.get("text") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => bail!("slack_send missing 'text'"),
            Some(other) => other.to_string(),
        };

        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await
            .map_err(|e| anyhow!("Slack request failed: {e}"))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("unreadable Slack response ({status}): {e}"))?;

        // Slack reports most failures as 200 with ok=false
        if !status.is_success() || body.get("ok").and_then(Value::as_bool) != Some(true) {
            let reason = body.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            bail!("Slack rejected message to {channel}: {reason} ({status})");
        }

        tracing::debug!("💬 Posted to Slack channel {}", channel);
        Ok(json!({
            "ok": true,
            "channel": body.get("channel").cloned().unwrap_or_else(|| json!(channel)),
            "ts": body.get("ts").cloned().unwrap_or(Value::Null),
        }))
    }
}
