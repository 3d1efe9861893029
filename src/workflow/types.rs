/// Core workflow type definitions
///
/// Workflows are a set of typed nodes plus labeled edges. They are stored as JSON
/// and snapshotted (cloned into an `Arc`) when an execution starts, so edits made
/// while a run is in flight never affect it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-onboarding"); the API fills it from the path when absent
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Owning user; executions inherit it
    #[serde(default)]
    pub user_id: String,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Edges in declaration order. Traversal follows them in this order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Inactive workflows are skipped by the scheduler and webhook ingestion
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of `node_id`, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type.is_trigger())
    }
}

/// A single node in the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "n1", "notify-team")
    pub id: String,
    /// The type of node which determines execution behavior
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Type-specific parameters; schema lives in [`crate::workflow::params`]
    #[serde(default)]
    pub params: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, params: Value) -> Self {
        Self {
            id: id.into(),
            node_type,
            params,
        }
    }
}

/// Closed set of node kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Started by `POST /api/workflows/{id}/execute`
    TriggerManual,
    /// Started by the scheduler. Params: { "cron": "0 9 * * *", "timezone": "Europe/Paris" }
    TriggerSchedule,
    /// Started by `POST /webhooks/{token}`. Params: { "token"?: "...", "secret"?: "..." }
    TriggerWebhook,

    /// Generic HTTP call. Params: { "url", "method"?, "headers"?, "body"? }
    HttpRequest,
    /// Params: { "channel", "text" }
    SlackSend,
    /// Params: { "spreadsheet_id", "range", "values" }
    GoogleSheetsWrite,
    /// Params: { "to", "subject", "body" }
    GmailSend,
    /// Params: { "database_id", "properties" }
    NotionCreatePage,
    /// Params: { "model", "prompt" }
    OpenaiChat,

    IfElse,
    Switch,
    Loop,
    Wait,
    Delay,
    SubWorkflow,
    ErrorHandler,
}

/// Coarse classification used by the validator and the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Trigger,
    Action,
    Control,
}

impl NodeType {
    pub fn kind(self) -> NodeKind {
        use NodeType::*;
        match self {
            TriggerManual | TriggerSchedule | TriggerWebhook => NodeKind::Trigger,
            HttpRequest | SlackSend | GoogleSheetsWrite | GmailSend | NotionCreatePage
            | OpenaiChat => NodeKind::Action,
            IfElse | Switch | Loop | Wait | Delay | SubWorkflow | ErrorHandler => NodeKind::Control,
        }
    }

    pub fn is_trigger(self) -> bool {
        self.kind() == NodeKind::Trigger
    }

    /// Wire name, identical to the serde representation
    pub fn as_str(self) -> &'static str {
        use NodeType::*;
        match self {
            TriggerManual => "trigger_manual",
            TriggerSchedule => "trigger_schedule",
            TriggerWebhook => "trigger_webhook",
            HttpRequest => "http_request",
            SlackSend => "slack_send",
            GoogleSheetsWrite => "google_sheets_write",
            GmailSend => "gmail_send",
            NotionCreatePage => "notion_create_page",
            OpenaiChat => "openai_chat",
            IfElse => "if_else",
            Switch => "switch",
            Loop => "loop",
            Wait => "wait",
            Delay => "delay",
            SubWorkflow => "sub_workflow",
            ErrorHandler => "error_handler",
        }
    }

    /// Circuit-breaker key of the external service an action node addresses
    pub fn target(self) -> Option<&'static str> {
        use NodeType::*;
        match self {
            HttpRequest => Some("http"),
            SlackSend => Some("slack"),
            GoogleSheetsWrite => Some("google-sheets"),
            GmailSend => Some("gmail"),
            NotionCreatePage => Some("notion"),
            OpenaiChat => Some("openai"),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection between two nodes
///
/// `label` selects the branch for if_else ("true"/"false"), switch (case label),
/// loop ("body") and error_handler (its branch label).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID
    pub from: String,
    /// Target node ID
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
        }
    }

    pub fn labeled(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: Some(label.into()),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label.as_deref() == Some(label)
    }
}
