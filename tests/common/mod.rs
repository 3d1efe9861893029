//! Shared fixtures: a store (in-memory unless given), engine with a live worker pool, and
//! recording/failing node handlers.
#![allow(dead_code)]

use async_trait::async_trait;
use flowmesh::config::{EngineConfig, QueueConfig};
use flowmesh::runtime::{BreakerRegistry, BreakerSettings, DispatchRegistry, ExecutionEngine, JobQueue, NodeHandler, WorkerPool, WorkflowJobProcessor};
use flowmesh::store::{Execution, ExecutionLog, InMemoryStore, LogLevel, Store};
use flowmesh::workflow::{Edge, Node, Workflow};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const OWNER: &str = "user-1";

/// Records the resolved params of every call and answers with a fixed output
pub struct Recording {
    calls: Mutex<Vec<Value>>,
    output: Value,
}

impl Recording {
    pub fn new(output: Value) -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()), output })
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl NodeHandler for Recording {
    async fn execute(&self, params: &Value, _context: &Value) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(params.clone());
        Ok(self.output.clone())
    }
}

/// Fails the first `failures` calls, then succeeds
pub struct Flaky {
    calls: AtomicU32,
    failures: u32,
}

impl Flaky {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), failures })
    }

    pub fn always() -> Arc<Self> {
        Self::new(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeHandler for Flaky {
    async fn execute(&self, _params: &Value, _context: &Value) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            anyhow::bail!("upstream returned 503 (call {n})");
        }
        Ok(json!({ "status": 200, "call": n }))
    }
}

pub fn registry() -> DispatchRegistry {
    registry_with(BreakerSettings::default())
}

pub fn registry_with(settings: BreakerSettings) -> DispatchRegistry {
    DispatchRegistry::new(Arc::new(BreakerRegistry::new(settings)))
}

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub engine: Arc<ExecutionEngine>,
    pub queue: JobQueue,
    pub workers: WorkerPool,
}

impl Harness {
    pub fn new(registry: DispatchRegistry) -> Self {
        Self::with_limits(registry, EngineConfig::default())
    }

    pub fn with_limits(registry: DispatchRegistry, limits: EngineConfig) -> Self {
        Self::with_store(registry, limits, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(registry: DispatchRegistry, limits: EngineConfig, store: Arc<dyn Store>) -> Self {
        let (queue, receiver) = JobQueue::new();
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            Arc::new(registry),
            queue.clone(),
            limits,
        ));
        let workers = WorkerPool::start(
            receiver,
            queue.clone(),
            Arc::new(WorkflowJobProcessor::new(engine.clone())),
            QueueConfig { workers: 4, max_attempts: 3, backoff_ms: 10 },
        );
        Self { store, engine, queue, workers }
    }

    /// Save `workflow`, run it from its manual trigger(s) and wait for the outcome
    pub async fn run(&self, workflow: Workflow, seed: Value) -> Execution {
        self.store.save_workflow(&workflow).await.unwrap();
        let id = self.engine.execute(workflow, seed, OWNER).await.unwrap();
        self.wait(id).await
    }

    pub async fn wait(&self, id: Uuid) -> Execution {
        tokio::time::timeout(Duration::from_secs(10), self.engine.wait_for(id))
            .await
            .expect("execution did not finish in time")
            .unwrap()
    }

    pub async fn logs(&self, id: Uuid) -> Vec<ExecutionLog> {
        self.store.list_logs(id).await.unwrap()
    }

    pub async fn logs_at(&self, id: Uuid, level: LogLevel) -> Vec<ExecutionLog> {
        self.logs(id).await.into_iter().filter(|l| l.level == level).collect()
    }
}

pub fn workflow(id: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
    Workflow {
        id: id.to_string(),
        name: format!("{id} workflow"),
        user_id: OWNER.to_string(),
        nodes,
        edges,
        active: true,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
