/// if_else condition evaluation and switch expression matching
///
/// Operands are template-resolved against the context document first, then
/// compared. Numeric operators accept numbers or numeric strings; anything that
/// can't be read as a number makes the comparison false.

use crate::runtime::context::{resolve, to_text};
use crate::workflow::params::{Combinator, Condition, IfElseConfig, Operator, SwitchConfig};
use serde_json::Value;

pub fn evaluate_if_else(config: &IfElseConfig, doc: &Value) -> bool {
    match config.combinator {
        Combinator::And => config.conditions.iter().all(|c| evaluate_condition(c, doc)),
        Combinator::Or => config.conditions.iter().any(|c| evaluate_condition(c, doc)),
    }
}

pub fn evaluate_condition(cond: &Condition, doc: &Value) -> bool {
    let left = resolve(&cond.left, doc);
    let right = resolve(&cond.right, doc);

    match cond.operator {
        Operator::Equals => loosely_equal(&left, &right),
        Operator::NotEquals => !loosely_equal(&left, &right),

        Operator::GreaterThan => numeric(&left, &right, |a, b| a > b),
        Operator::GreaterThanOrEqual => numeric(&left, &right, |a, b| a >= b),
        Operator::LessThan => numeric(&left, &right, |a, b| a < b),
        Operator::LessThanOrEqual => numeric(&left, &right, |a, b| a <= b),

        Operator::Contains => contains(&left, &right),
        Operator::NotContains => !contains(&left, &right),
        Operator::StartsWith => to_text(&left).starts_with(&to_text(&right)),
        Operator::EndsWith => to_text(&left).ends_with(&to_text(&right)),

        Operator::IsEmpty => is_empty(&left),
        Operator::IsNotEmpty => !is_empty(&left),
        Operator::Exists => !left.is_null(),
    }
}

/// Label of the outgoing edge a switch should follow, `None` for the default path
pub fn switch_label(config: &SwitchConfig, doc: &Value) -> Option<String> {
    let key = to_text(&resolve(&config.expression, doc));
    config.cases.get(&key).cloned()
}

fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        // "200" == 200, both sides number-like
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (to_f64(a), to_f64(b)) {
                (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
                _ => false,
            }
        }
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => s == &x.to_string(),
        _ => false,
    }
}

fn numeric(a: &Value, b: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (to_f64(a), to_f64(b)) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&to_text(needle)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => map.contains_key(&to_text(needle)),
        _ => false,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(left: Value, operator: Operator, right: Value) -> Condition {
        Condition { left, operator, right }
    }

    fn doc() -> Value {
        json!({
            "trigger": { "amount": "120.5", "tags": ["vip", "eu"], "email": "ada@example.com" },
            "nodes": { "fetch": { "status": 200, "data": [] } },
            "error": null
        })
    }

    #[test]
    fn numeric_comparisons_accept_numeric_strings() {
        let d = doc();
        assert!(evaluate_condition(&cond(json!("{{trigger.amount}}"), Operator::GreaterThan, json!(100)), &d));
        assert!(evaluate_condition(&cond(json!("{{nodes.fetch.status}}"), Operator::Equals, json!("200")), &d));
        assert!(!evaluate_condition(&cond(json!("{{trigger.email}}"), Operator::LessThan, json!(5)), &d));
    }

    #[test]
    fn string_and_collection_operators() {
        let d = doc();
        assert!(evaluate_condition(&cond(json!("{{trigger.tags}}"), Operator::Contains, json!("vip")), &d));
        assert!(evaluate_condition(&cond(json!("{{trigger.email}}"), Operator::EndsWith, json!("@example.com")), &d));
        assert!(evaluate_condition(&cond(json!("{{nodes.fetch.data}}"), Operator::IsEmpty, Value::Null), &d));
        assert!(!evaluate_condition(&cond(json!("{{nodes.nope}}"), Operator::Exists, Value::Null), &d));
    }

    #[test]
    fn combinators() {
        let d = doc();
        let yes = cond(json!(1), Operator::Equals, json!(1));
        let no = cond(json!(1), Operator::Equals, json!(2));
        let and = IfElseConfig { conditions: vec![yes.clone(), no.clone()], combinator: Combinator::And };
        let or = IfElseConfig { conditions: vec![yes, no], combinator: Combinator::Or };
        assert!(!evaluate_if_else(&and, &d));
        assert!(evaluate_if_else(&or, &d));
    }

    #[test]
    fn switch_maps_value_to_label() {
        let d = doc();
        let config: SwitchConfig = serde_json::from_value(json!({
            "expression": "{{nodes.fetch.status}}",
            "cases": { "200": "ok", "404": "missing" }
        }))
        .unwrap();
        assert_eq!(switch_label(&config, &d), Some("ok".to_string()));

        let other: SwitchConfig = serde_json::from_value(json!({
            "expression": "{{trigger.email}}",
            "cases": { "200": "ok" }
        }))
        .unwrap();
        assert_eq!(switch_label(&other, &d), None);
    }
}
