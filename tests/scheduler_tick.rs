mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::*;
use flowmesh::runtime::Scheduler;
use flowmesh::store::{ExecutionStatus, Schedule, Store};
use flowmesh::workflow::triggers::sync_triggers;
use flowmesh::workflow::{Edge, Node, NodeType};
use serde_json::json;
use uuid::Uuid;

fn scheduled(id: &str) -> flowmesh::Workflow {
    workflow(
        id,
        vec![
            Node::new("every-5", NodeType::TriggerSchedule, json!({ "cron": "*/5 * * * *" })),
            Node::new("ping", NodeType::HttpRequest, json!({ "url": "https://ping.example.com/{{trigger.cron}}" })),
        ],
        vec![Edge::new("every-5", "ping")],
    )
}

async fn finished_executions(harness: &Harness, expected: usize) -> Vec<flowmesh::store::Execution> {
    let store = harness.store.clone();
    let done = eventually(|| {
        let store = store.clone();
        async move {
            let all = store.list_executions(OWNER, 50).await.unwrap();
            all.len() == expected && all.iter().all(|e| e.status.is_terminal())
        }
    })
    .await;
    assert!(done, "expected {expected} finished execution(s)");
    harness.store.list_executions(OWNER, 50).await.unwrap()
}

#[tokio::test]
async fn due_schedule_fires_once_and_advances() {
    let http_mock = Recording::new(json!({ "status": 200 }));
    let harness = Harness::new(registry().with(NodeType::HttpRequest, http_mock.clone()));
    let wf = scheduled("report");
    harness.store.save_workflow(&wf).await.unwrap();
    let (schedules, _) = sync_triggers(harness.store.as_ref(), &wf).await.unwrap();
    let schedule = schedules[0].clone();

    let scheduler = Scheduler::new(harness.store.clone(), harness.queue.clone());
    let now = schedule.next_run + ChronoDuration::seconds(1);

    let report = scheduler.tick(now).await.unwrap();
    assert_eq!(report.fired, vec![schedule.id]);

    let again = scheduler.tick(now).await.unwrap();
    assert!(again.fired.is_empty());

    let stored = harness.store.list_schedules("report").await.unwrap();
    assert!(stored[0].next_run > now);
    assert_eq!(stored[0].last_run, Some(now));

    let executions = finished_executions(&harness, 1).await;
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(http_mock.calls()[0]["url"], json!("https://ping.example.com/*/5 * * * *"));
}

#[tokio::test]
async fn schedule_advances_even_when_the_run_fails() {
    let harness = Harness::new(registry().with(NodeType::HttpRequest, Flaky::always()));
    let wf = scheduled("flaky-report");
    harness.store.save_workflow(&wf).await.unwrap();
    let (schedules, _) = sync_triggers(harness.store.as_ref(), &wf).await.unwrap();

    let scheduler = Scheduler::new(harness.store.clone(), harness.queue.clone());
    let now = schedules[0].next_run + ChronoDuration::seconds(1);
    assert_eq!(scheduler.tick(now).await.unwrap().fired.len(), 1);

    let executions = finished_executions(&harness, 1).await;
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(harness.store.due_schedules(now).await.unwrap().is_empty());
}

#[tokio::test]
async fn bad_cron_stays_due_and_enqueues_nothing() {
    let harness = Harness::new(registry());
    let wf = scheduled("broken-cron");
    harness.store.save_workflow(&wf).await.unwrap();

    let past = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let schedule = Schedule {
        id: Uuid::new_v4(),
        workflow_id: "broken-cron".into(),
        node_id: "every-5".into(),
        cron: "every tuesday-ish".into(),
        timezone: "UTC".into(),
        next_run: past,
        last_run: None,
        active: true,
    };
    harness.store.replace_schedules("broken-cron", &[schedule.clone()]).await.unwrap();

    let scheduler = Scheduler::new(harness.store.clone(), harness.queue.clone());
    let now = Utc::now();
    let report = scheduler.tick(now).await.unwrap();
    assert_eq!(report.invalid, vec![schedule.id]);
    assert!(report.fired.is_empty());

    let still_due = harness.store.due_schedules(now).await.unwrap();
    assert_eq!(still_due[0].next_run, past);
    assert!(harness.store.list_executions(OWNER, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_schedulers_fire_a_schedule_once() {
    let harness = Harness::new(registry().with(NodeType::HttpRequest, Recording::new(json!({}))));
    let wf = scheduled("shared");
    harness.store.save_workflow(&wf).await.unwrap();
    let (schedules, _) = sync_triggers(harness.store.as_ref(), &wf).await.unwrap();

    let a = Scheduler::new(harness.store.clone(), harness.queue.clone());
    let b = Scheduler::new(harness.store.clone(), harness.queue.clone());
    let now = schedules[0].next_run + ChronoDuration::seconds(1);

    let (ra, rb) = tokio::join!(a.tick(now), b.tick(now));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.fired.len() + rb.fired.len(), 1);

    finished_executions(&harness, 1).await;
}

#[tokio::test]
async fn inactive_workflow_is_claimed_but_not_run() {
    let harness = Harness::new(registry());
    let wf = scheduled("paused");
    harness.store.save_workflow(&wf).await.unwrap();
    let (schedules, _) = sync_triggers(harness.store.as_ref(), &wf).await.unwrap();

    let mut paused = wf.clone();
    paused.active = false;
    harness.store.save_workflow(&paused).await.unwrap();

    let scheduler = Scheduler::new(harness.store.clone(), harness.queue.clone());
    let now = schedules[0].next_run + ChronoDuration::seconds(1);
    let report = scheduler.tick(now).await.unwrap();
    assert_eq!(report.skipped, vec![schedules[0].id]);
    assert!(harness.store.due_schedules(now).await.unwrap().is_empty());
    assert!(harness.store.list_executions(OWNER, 10).await.unwrap().is_empty());
}
