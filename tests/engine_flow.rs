mod common;

use common::*;
use flowmesh::config::EngineConfig;
use flowmesh::store::{ExecutionStatus, LogLevel, Store};
use flowmesh::workflow::{Edge, Node, NodeType};
use flowmesh::EngineError;
use serde_json::json;

fn manual() -> Node {
    Node::new("start", NodeType::TriggerManual, json!({}))
}

fn http(id: &str, url: &str) -> Node {
    Node::new(id, NodeType::HttpRequest, json!({ "url": url }))
}

fn slack(id: &str, channel: &str, text: &str) -> Node {
    Node::new(id, NodeType::SlackSend, json!({ "channel": channel, "text": text }))
}

#[tokio::test]
async fn http_then_slack_completes_with_one_log_per_action() {
    let http_mock = Recording::new(json!({ "status": 200, "data": { "ok": true } }));
    let slack_mock = Recording::new(json!({ "ok": true }));
    let harness = Harness::new(
        registry()
            .with(NodeType::HttpRequest, http_mock.clone())
            .with(NodeType::SlackSend, slack_mock.clone()),
    );

    let wf = workflow(
        "notify",
        vec![
            manual(),
            http("fetch", "https://api.example.com/health"),
            slack("announce", "#general", "health is {{nodes.fetch.status}}"),
        ],
        vec![Edge::new("start", "fetch"), Edge::new("fetch", "announce")],
    );
    let execution = harness.run(wf, json!({})).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.finished_at.is_some());
    let logs = harness.logs_at(execution.id, LogLevel::Info).await;
    let nodes: Vec<&str> = logs.iter().map(|l| l.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["fetch", "announce"]);

    assert_eq!(http_mock.count(), 1);
    assert_eq!(slack_mock.calls()[0]["text"], json!("health is 200"));
    assert_eq!(execution.result["outputs"]["announce"], json!({ "ok": true }));
}

#[tokio::test]
async fn trigger_seed_is_visible_to_templates() {
    let http_mock = Recording::new(json!({}));
    let harness = Harness::new(registry().with(NodeType::HttpRequest, http_mock.clone()));

    let mut node = http("lookup", "https://api.example.com/users/{{trigger.user.id}}");
    node.params["body"] = json!({ "tags": "{{trigger.tags}}" });
    let wf = workflow("seeded", vec![manual(), node], vec![Edge::new("start", "lookup")]);

    let execution = harness.run(wf, json!({ "user": { "id": 42 }, "tags": ["a", "b"] })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let call = &http_mock.calls()[0];
    assert_eq!(call["url"], json!("https://api.example.com/users/42"));
    assert_eq!(call["body"]["tags"], json!(["a", "b"]));
}

#[tokio::test]
async fn if_else_follows_only_the_matching_edge() {
    let slack_mock = Recording::new(json!({ "ok": true }));
    let harness = Harness::new(registry().with(NodeType::SlackSend, slack_mock.clone()));

    let check = Node::new(
        "check",
        NodeType::IfElse,
        json!({ "conditions": [{ "left": "{{trigger.amount}}", "operator": "greater_than", "right": 100 }] }),
    );
    let wf = workflow(
        "route",
        vec![manual(), check, slack("big", "#big", "big"), slack("small", "#small", "small")],
        vec![
            Edge::new("start", "check"),
            Edge::labeled("check", "big", "true"),
            Edge::labeled("check", "small", "false"),
        ],
    );

    let execution = harness.run(wf.clone(), json!({ "amount": 150 })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(slack_mock.count(), 1);
    assert_eq!(slack_mock.calls()[0]["channel"], json!("#big"));

    let execution = harness.run(wf, json!({ "amount": "12" })).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(slack_mock.calls()[1]["channel"], json!("#small"));
}

#[tokio::test]
async fn switch_falls_back_to_unlabeled_edges() {
    let slack_mock = Recording::new(json!({ "ok": true }));
    let harness = Harness::new(registry().with(NodeType::SlackSend, slack_mock.clone()));

    let router = Node::new(
        "kind",
        NodeType::Switch,
        json!({ "expression": "{{trigger.kind}}", "cases": { "invoice": "billing", "ticket": "support" } }),
    );
    let wf = workflow(
        "switch",
        vec![
            manual(),
            router,
            slack("billing", "#billing", "b"),
            slack("support", "#support", "s"),
            slack("other", "#triage", "o"),
        ],
        vec![
            Edge::new("start", "kind"),
            Edge::labeled("kind", "billing", "billing"),
            Edge::labeled("kind", "support", "support"),
            Edge::new("kind", "other"),
        ],
    );

    harness.run(wf.clone(), json!({ "kind": "ticket" })).await;
    harness.run(wf, json!({ "kind": "newsletter" })).await;

    let channels: Vec<_> = slack_mock.calls().iter().map(|c| c["channel"].clone()).collect();
    assert_eq!(channels, vec![json!("#support"), json!("#triage")]);
}

#[tokio::test]
async fn loop_runs_body_n_times_and_records_each_iteration() {
    let http_mock = Recording::new(json!({ "status": 200 }));
    let slack_mock = Recording::new(json!({ "ok": true }));
    let harness = Harness::new(
        registry()
            .with(NodeType::HttpRequest, http_mock.clone())
            .with(NodeType::SlackSend, slack_mock.clone()),
    );

    let mut summary = slack("done", "#general", "{{nodes.repeat.index}}");
    summary.params["iterations"] = json!("{{nodes.repeat.iterations}}");
    let wf = workflow(
        "loop",
        vec![
            manual(),
            Node::new("repeat", NodeType::Loop, json!({ "iterations": 3 })),
            http("page", "https://api.example.com/items?page={{nodes.repeat.index}}"),
            summary,
        ],
        vec![
            Edge::new("start", "repeat"),
            Edge::labeled("repeat", "page", "body"),
            Edge::new("repeat", "done"),
        ],
    );

    let execution = harness.run(wf, json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let urls: Vec<_> = http_mock.calls().iter().map(|c| c["url"].clone()).collect();
    assert_eq!(
        urls,
        vec![
            json!("https://api.example.com/items?page=0"),
            json!("https://api.example.com/items?page=1"),
            json!("https://api.example.com/items?page=2"),
        ]
    );
    assert_eq!(slack_mock.count(), 1);
    let summary = &slack_mock.calls()[0];
    assert_eq!(summary["text"], json!(3));
    assert_eq!(summary["iterations"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn loop_with_zero_iterations_skips_the_body() {
    let http_mock = Recording::new(json!({}));
    let slack_mock = Recording::new(json!({ "ok": true }));
    let harness = Harness::new(
        registry()
            .with(NodeType::HttpRequest, http_mock.clone())
            .with(NodeType::SlackSend, slack_mock.clone()),
    );

    let wf = workflow(
        "empty-loop",
        vec![
            manual(),
            Node::new("repeat", NodeType::Loop, json!({ "iterations": 0 })),
            http("page", "https://api.example.com"),
            slack("done", "#general", "done"),
        ],
        vec![
            Edge::new("start", "repeat"),
            Edge::labeled("repeat", "page", "body"),
            Edge::new("repeat", "done"),
        ],
    );

    let execution = harness.run(wf, json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(http_mock.count(), 0);
    assert_eq!(slack_mock.count(), 1);
}

#[tokio::test]
async fn loop_over_the_ceiling_fails_the_execution() {
    let http_mock = Recording::new(json!({}));
    let harness = Harness::with_limits(
        registry().with(NodeType::HttpRequest, http_mock.clone()),
        EngineConfig { max_loop_iterations: 5, ..EngineConfig::default() },
    );

    let wf = workflow(
        "runaway",
        vec![
            manual(),
            Node::new("repeat", NodeType::Loop, json!({ "iterations": 6 })),
            http("page", "https://api.example.com"),
        ],
        vec![Edge::new("start", "repeat"), Edge::labeled("repeat", "page", "body")],
    );

    let execution = harness.run(wf, json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap_or_default().contains("loop limit exceeded"));
    assert_eq!(http_mock.count(), 0);
}

#[tokio::test]
async fn unguarded_cycles_hit_the_visit_ceiling() {
    let http_mock = Recording::new(json!({}));
    let harness = Harness::with_limits(
        registry().with(NodeType::HttpRequest, http_mock.clone()),
        EngineConfig { max_node_visits: 4, ..EngineConfig::default() },
    );

    let wf = workflow(
        "cycle",
        vec![manual(), http("a", "https://a.example.com"), http("b", "https://b.example.com")],
        vec![Edge::new("start", "a"), Edge::new("a", "b"), Edge::new("b", "a")],
    );

    let execution = harness.run(wf, json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(http_mock.count(), 8);
}

#[tokio::test]
async fn fan_out_runs_every_branch_and_collects_leaves() {
    let http_mock = Recording::new(json!({ "status": 200 }));
    let slack_mock = Recording::new(json!({ "ok": true }));
    let harness = Harness::new(
        registry()
            .with(NodeType::HttpRequest, http_mock.clone())
            .with(NodeType::SlackSend, slack_mock.clone()),
    );

    let wf = workflow(
        "fan-out",
        vec![manual(), http("audit", "https://audit.example.com"), slack("tell", "#ops", "hi")],
        vec![Edge::new("start", "audit"), Edge::new("start", "tell")],
    );

    let execution = harness.run(wf, json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let outputs = execution.result["outputs"].as_object().cloned().unwrap_or_default();
    assert!(outputs.contains_key("audit"));
    assert!(outputs.contains_key("tell"));
}

#[tokio::test]
async fn malformed_graph_is_rejected_before_anything_is_stored() {
    let harness = Harness::new(registry());
    let wf = workflow(
        "broken",
        vec![manual(), http("fetch", "https://api.example.com")],
        vec![Edge::new("start", "fetch"), Edge::new("fetch", "ghost")],
    );

    let err = harness.engine.execute(wf, json!({}), OWNER).await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedGraph { ref node_id, .. } if node_id == "ghost"));
    assert!(harness.store.list_executions(OWNER, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_handler_fails_without_retrying() {
    let harness = Harness::new(registry());
    let wf = workflow(
        "no-handler",
        vec![
            manual(),
            Node::new("ask", NodeType::OpenaiChat, json!({ "model": "gpt", "prompt": "hi" })),
        ],
        vec![Edge::new("start", "ask")],
    );

    let execution = harness.run(wf, json!({})).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let errors = harness.logs_at(execution.id, LogLevel::Error).await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("openai_chat"));
}

#[tokio::test]
async fn logs_come_back_in_append_order() {
    let http_mock = Recording::new(json!({}));
    let harness = Harness::new(registry().with(NodeType::HttpRequest, http_mock));

    let nodes = vec![
        manual(),
        http("one", "https://1.example.com"),
        http("two", "https://2.example.com"),
        http("three", "https://3.example.com"),
    ];
    let wf = workflow(
        "chain",
        nodes,
        vec![Edge::new("start", "one"), Edge::new("one", "two"), Edge::new("two", "three")],
    );

    let execution = harness.run(wf, json!({})).await;
    let logs = harness.logs(execution.id).await;
    let order: Vec<&str> = logs.iter().map(|l| l.node_id.as_str()).collect();
    assert_eq!(order, vec!["one", "two", "three"]);
    assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}
