/// Node parameter schemas and typed control-flow configuration
///
/// Every node type declares a static list of fields. `check_schema` is the
/// edit-time check (kinds and presence); `require_fields` is the run-time
/// presence check. Extra fields are ignored and nothing is coerced.
///
/// Control-flow nodes additionally deserialize their params into the typed
/// structs below so the engine never pokes at raw JSON for them.

use crate::error::EngineError;
use crate::workflow::types::{Node, NodeType};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// Any JSON value, including a template string
    Any,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            // A template string may stand in for a number/bool/object resolved at run time
            FieldKind::Number => value.is_number() || is_template(value),
            FieldKind::Bool => value.is_boolean() || is_template(value),
            FieldKind::Object => value.is_object() || is_template(value),
            FieldKind::Array => value.is_array() || is_template(value),
            FieldKind::Any => true,
        }
    }
}

fn is_template(value: &Value) -> bool {
    value.as_str().map(|s| s.contains("{{")).unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: true }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: false }
}

/// Field list for a node type
pub fn schema(node_type: NodeType) -> &'static [FieldSpec] {
    use FieldKind::*;
    use NodeType as T;
    match node_type {
        T::TriggerManual => &[],
        T::TriggerSchedule => const { &[req("cron", String), opt("timezone", String)] },
        T::TriggerWebhook => const { &[opt("token", String), opt("secret", String)] },
        T::HttpRequest => const { &[
            req("url", String),
            opt("method", String),
            opt("headers", Object),
            opt("query", Object),
            opt("body", Any),
        ] },
        T::SlackSend => const { &[req("channel", String), req("text", String)] },
        T::GoogleSheetsWrite => const { &[
            req("spreadsheet_id", String),
            req("range", String),
            req("values", Array),
        ] },
        T::GmailSend => const { &[req("to", String), req("subject", String), opt("body", String)] },
        T::NotionCreatePage => const { &[req("database_id", String), opt("properties", Object)] },
        T::OpenaiChat => const { &[req("model", String), req("prompt", String)] },
        T::IfElse => const { &[req("conditions", Array), opt("combinator", String)] },
        T::Switch => const { &[req("expression", Any), req("cases", Object)] },
        T::Loop => const { &[req("iterations", Number)] },
        T::Wait | T::Delay => const { &[
            opt("seconds", Number),
            opt("milliseconds", Number),
            opt("until", String),
        ] },
        T::SubWorkflow => const { &[
            req("workflow_id", String),
            opt("wait_for_completion", Bool),
            opt("input", Any),
        ] },
        T::ErrorHandler => const { &[
            req("action", String),
            opt("max_retries", Number),
            opt("message", String),
            opt("branch_label", String),
        ] },
    }
}

/// Edit-time check: required fields present, declared kinds respected
pub fn check_schema(node: &Node) -> Result<(), EngineError> {
    let empty = serde_json::Map::new();
    let params = match &node.params {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(EngineError::invalid_config(&node.id, "params must be an object")),
    };

    for field in schema(node.node_type) {
        match params.get(field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(EngineError::invalid_config(
                    &node.id,
                    format!("missing required field '{}'", field.name),
                ));
            }
            Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                return Err(EngineError::invalid_config(
                    &node.id,
                    format!("field '{}' must be {:?}", field.name, field.kind),
                ));
            }
            _ => {}
        }
    }

    // Typed configs catch what the flat schema can't (operators, actions, ...)
    match node.node_type {
        NodeType::IfElse => IfElseConfig::from_node(node).map(|_| ()),
        NodeType::Switch => SwitchConfig::from_node(node).map(|_| ()),
        NodeType::Loop => LoopConfig::from_node(node).map(|_| ()),
        NodeType::Wait | NodeType::Delay => WaitConfig::from_node(node).map(|_| ()),
        NodeType::SubWorkflow => SubWorkflowConfig::from_node(node).map(|_| ()),
        NodeType::ErrorHandler => ErrorHandlerConfig::from_node(node).map(|_| ()),
        _ => Ok(()),
    }
}

/// Run-time check: only presence of required fields
pub fn require_fields(node: &Node) -> Result<(), EngineError> {
    for field in schema(node.node_type).iter().filter(|f| f.required) {
        let present = node
            .params
            .get(field.name)
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !present {
            return Err(EngineError::invalid_config(
                &node.id,
                format!("missing required field '{}'", field.name),
            ));
        }
    }
    Ok(())
}

fn parse<T: for<'de> Deserialize<'de>>(node: &Node) -> Result<T, EngineError> {
    let params = if node.params.is_null() {
        Value::Object(Default::default())
    } else {
        node.params.clone()
    };
    serde_json::from_value(params).map_err(|e| EngineError::invalid_config(&node.id, e.to_string()))
}

// ---------------------------------------------------------------------------
// if_else
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
    Exists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Usually a template such as "{{nodes.fetch.status}}"
    pub left: Value,
    pub operator: Operator,
    #[serde(default)]
    pub right: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfElseConfig {
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub combinator: Combinator,
}

impl IfElseConfig {
    pub fn from_node(node: &Node) -> Result<Self, EngineError> {
        parse(node)
    }
}

// ---------------------------------------------------------------------------
// switch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub expression: Value,
    /// Evaluated value (as text) -> outgoing edge label
    pub cases: BTreeMap<String, String>,
}

impl SwitchConfig {
    pub fn from_node(node: &Node) -> Result<Self, EngineError> {
        parse(node)
    }
}

// ---------------------------------------------------------------------------
// loop
// ---------------------------------------------------------------------------

pub const LOOP_BODY_LABEL: &str = "body";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub iterations: u32,
}

impl LoopConfig {
    pub fn from_node(node: &Node) -> Result<Self, EngineError> {
        parse(node)
    }
}

// ---------------------------------------------------------------------------
// wait / delay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default)]
    pub seconds: Option<f64>,
    #[serde(default)]
    pub milliseconds: Option<u64>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl WaitConfig {
    pub fn from_node(node: &Node) -> Result<Self, EngineError> {
        let config: WaitConfig = parse(node)?;
        if config.seconds.is_none() && config.milliseconds.is_none() && config.until.is_none() {
            return Err(EngineError::invalid_config(
                &node.id,
                "one of 'seconds', 'milliseconds' or 'until' is required",
            ));
        }
        if config.seconds.map(|s| s < 0.0 || !s.is_finite()).unwrap_or(false) {
            return Err(EngineError::invalid_config(&node.id, "'seconds' must be a non-negative number"));
        }
        config.resume_at(&node.id, Utc::now())?;
        Ok(config)
    }

    /// Relative part of the wait; `None` if it doesn't fit a `TimeDelta`
    fn delay(&self) -> Option<TimeDelta> {
        match (self.milliseconds, self.seconds) {
            (Some(ms), _) => i64::try_from(ms).ok().and_then(TimeDelta::try_milliseconds),
            (None, Some(s)) => {
                let ms = (s * 1000.0).round();
                if !(0.0..i64::MAX as f64).contains(&ms) {
                    return None;
                }
                TimeDelta::try_milliseconds(ms as i64)
            }
            (None, None) => Some(TimeDelta::zero()),
        }
    }

    /// Absolute instant at which the suspended branch may continue
    pub fn resume_at(&self, node_id: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        if let Some(until) = self.until {
            return Ok(until);
        }
        self.delay()
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| EngineError::invalid_config(node_id, "wait duration is out of range"))
    }
}

// ---------------------------------------------------------------------------
// sub_workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    pub workflow_id: String,
    #[serde(default)]
    pub wait_for_completion: bool,
    /// Seed for the child run; defaults to the parent's trigger payload
    #[serde(default)]
    pub input: Option<Value>,
}

impl SubWorkflowConfig {
    pub fn from_node(node: &Node) -> Result<Self, EngineError> {
        parse(node)
    }
}

// ---------------------------------------------------------------------------
// error_handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Retry,
    StopWorkflow,
    SendNotification,
    Branch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    pub action: ErrorAction,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_branch_label")]
    pub branch_label: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_branch_label() -> String {
    "error".to_string()
}

impl ErrorHandlerConfig {
    pub fn from_node(node: &Node) -> Result<Self, EngineError> {
        parse(node)
    }
}
