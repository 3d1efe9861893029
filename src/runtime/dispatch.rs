/// Node dispatch registry
///
/// Maps action node types to handlers. Handlers are never called directly by
/// the engine: `invoke` always goes through the circuit breaker of the node
/// type's target.

use crate::error::EngineError;
use crate::runtime::breaker::BreakerRegistry;
use crate::workflow::{Node, NodeType};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Adapter for one external service
///
/// `params` are the node's parameters with templates already resolved;
/// `context` is the full data context document, read-only.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, params: &Value, context: &Value) -> anyhow::Result<Value>;
}

pub struct DispatchRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
    breakers: Arc<BreakerRegistry>,
}

impl DispatchRegistry {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            handlers: HashMap::new(),
            breakers,
        }
    }

    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) -> &mut Self {
        self.handlers.insert(node_type, handler);
        self
    }

    pub fn with(mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) -> Self {
        self.register(node_type, handler);
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn resolve(&self, node_type: NodeType) -> Result<Arc<dyn NodeHandler>, EngineError> {
        self.handlers
            .get(&node_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNodeType(node_type.to_string()))
    }

    /// Resolve, then run the handler behind its target's breaker
    pub async fn invoke(&self, node: &Node, params: &Value, context: &Value) -> Result<Value, EngineError> {
        let handler = self.resolve(node.node_type)?;
        let target = node.node_type.target().unwrap_or(node.node_type.as_str());
        let breaker = self.breakers.get(target);

        match breaker.call(|| handler.execute(params, context)).await? {
            Ok(output) => Ok(output),
            Err(e) => Err(EngineError::Handler {
                node_id: node.id.clone(),
                message: format!("{e:#}"),
            }),
        }
    }
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::breaker::{BreakerSettings, BreakerState};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl NodeHandler for Echo {
        async fn execute(&self, params: &Value, _context: &Value) -> anyhow::Result<Value> {
            Ok(params.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl NodeHandler for Broken {
        async fn execute(&self, _params: &Value, _context: &Value) -> anyhow::Result<Value> {
            anyhow::bail!("503 Service Unavailable")
        }
    }

    #[tokio::test]
    async fn unregistered_type_is_unknown() {
        let registry = DispatchRegistry::new(Arc::new(BreakerRegistry::default()));
        let err = registry.resolve(NodeType::GmailSend).err().unwrap();
        assert!(matches!(err, EngineError::UnknownNodeType(ref t) if t == "gmail_send"));
    }

    #[tokio::test]
    async fn invoke_passes_params_through() {
        let registry = DispatchRegistry::new(Arc::new(BreakerRegistry::default()))
            .with(NodeType::SlackSend, Arc::new(Echo));
        let node = Node::new("notify", NodeType::SlackSend, json!({}));
        let out = registry.invoke(&node, &json!({ "text": "hi" }), &json!({})).await.unwrap();
        assert_eq!(out, json!({ "text": "hi" }));
    }

    #[tokio::test]
    async fn failures_feed_the_target_breaker() {
        let settings = BreakerSettings {
            volume_threshold: 2,
            failure_threshold: 2,
            ..Default::default()
        };
        let registry = DispatchRegistry::new(Arc::new(BreakerRegistry::new(settings)))
            .with(NodeType::SlackSend, Arc::new(Broken));
        let node = Node::new("notify", NodeType::SlackSend, json!({}));

        for _ in 0..2 {
            let err = registry.invoke(&node, &json!({}), &json!({})).await.unwrap_err();
            assert!(matches!(err, EngineError::Handler { .. }));
        }
        assert_eq!(registry.breakers().get("slack").state(), BreakerState::Open);

        let err = registry.invoke(&node, &json!({}), &json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { ref target } if target == "slack"));
    }
}
