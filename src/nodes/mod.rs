/// Built-in node handlers
///
/// Only the generic HTTP handler and Slack ship with the engine. The other
/// action types (`google_sheets_write`, `gmail_send`, `notion_create_page`,
/// `openai_chat`) are registered by the embedding application; until then a
/// run reaching one fails with `UnknownNodeType`.

pub mod http;
pub mod slack;

pub use http::HttpRequestHandler;
pub use slack::SlackHandler;

use crate::config::IntegrationsConfig;
use crate::runtime::breaker::BreakerRegistry;
use crate::runtime::dispatch::DispatchRegistry;
use crate::workflow::NodeType;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Registry with every built-in handler the configuration allows
pub fn default_registry(integrations: &IntegrationsConfig, breakers: Arc<BreakerRegistry>) -> Result<DispatchRegistry> {
    let timeout = Duration::from_secs(integrations.http_timeout_secs);
    let mut registry = DispatchRegistry::new(breakers);

    registry.register(NodeType::HttpRequest, Arc::new(HttpRequestHandler::new(timeout)?));

    match &integrations.slack_token {
        Some(token) => {
            let mut slack = SlackHandler::new(token.clone(), timeout)?;
            if let Some(url) = &integrations.slack_api_url {
                tracing::info!("💬 Slack API root overridden: {}", url);
                slack = slack.with_base_url(url.clone());
            }
            registry.register(NodeType::SlackSend, Arc::new(slack));
        }
        None => tracing::warn!("⚠️ FLOWMESH_SLACK_TOKEN not set, slack_send nodes will fail"),
    }

    Ok(registry)
}
