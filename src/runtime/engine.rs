/// Graph execution engine
///
/// An execution is a set of *branches* walking the workflow snapshot from its
/// trigger node(s). Each branch is a small serialisable cursor (current node,
/// active error-handler scopes, loop frames, retry counters) and travels through
/// the job queue as a `Continue` job, which is how `wait`/`delay` and
/// `sub_workflow` suspend without holding a worker.
///
/// Shared per-execution state (data context, outstanding branch count, leaf
/// outputs, failures, visit counters) lives in an in-process [`ExecutionRun`].
/// The execution is finalised when its last outstanding branch ends.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::runtime::conditions::{evaluate_if_else, switch_label};
use crate::runtime::context::{resolve, resolve_str, to_text, DataContext};
use crate::runtime::dispatch::DispatchRegistry;
use crate::runtime::queue::{JobKind, JobQueue};
use crate::store::{Execution, ExecutionLog, ExecutionStatus, LogLevel, Store};
use crate::workflow::params::{
    self, ErrorAction, ErrorHandlerConfig, IfElseConfig, LoopConfig, SubWorkflowConfig, SwitchConfig,
    WaitConfig, LOOP_BODY_LABEL,
};
use crate::workflow::{validate_graph, Edge, Node, NodeKind, NodeType, Workflow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Requests and branch state (these travel through the job queue)
// ---------------------------------------------------------------------------

/// Set on executions started by a `sub_workflow` node
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParentLink {
    pub execution_id: Uuid,
    /// Nesting depth of the child; the root execution is 0
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Snapshot the execution will run against
    pub workflow: Workflow,
    #[serde(default)]
    pub seed: Value,
    /// Falls back to the workflow owner when empty
    #[serde(default)]
    pub user_id: String,
    /// Trigger to start from; `None` starts from the manual triggers (or all
    /// triggers when the workflow has no manual one)
    #[serde(default)]
    pub start_node: Option<String>,
    #[serde(default)]
    pub parent: Option<ParentLink>,
}

impl ExecutionRequest {
    pub fn new(workflow: Workflow, seed: Value) -> Self {
        Self {
            user_id: workflow.user_id.clone(),
            workflow,
            seed,
            start_node: None,
            parent: None,
        }
    }

    pub fn owned_by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn starting_at(mut self, node_id: impl Into<String>) -> Self {
        self.start_node = Some(node_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerScope {
    /// The `error_handler` node guarding the nodes after it on this branch
    pub handler_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopFrame {
    /// The `loop` node that owns this frame
    pub loop_id: String,
    /// Finished iterations
    pub index: u32,
    pub total: u32,
}

/// Why a suspended branch is being resumed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ResumeSignal {
    WaitElapsed,
    ChildFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Value,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branch {
    /// Node to process next
    pub cursor: String,
    /// Innermost error_handler last
    #[serde(default)]
    pub handlers: Vec<HandlerScope>,
    /// Innermost loop last
    #[serde(default)]
    pub frames: Vec<LoopFrame>,
    /// Retries used per node
    #[serde(default)]
    pub attempts: HashMap<String, u32>,
    /// Set while the cursor node is being re-entered after a suspension
    #[serde(default)]
    pub resume: Option<ResumeSignal>,
    /// Last node that completed on this branch
    #[serde(default)]
    pub last: Option<String>,
}

impl Branch {
    pub fn at(cursor: impl Into<String>) -> Self {
        Self {
            cursor: cursor.into(),
            ..Default::default()
        }
    }

    /// Fan-out copy: keeps error scopes, drops loop frames (only the primary
    /// branch drives a loop's iterations).
    fn sibling(&self, cursor: String) -> Self {
        Self {
            cursor,
            handlers: self.handlers.clone(),
            frames: Vec::new(),
            attempts: HashMap::new(),
            resume: None,
            last: self.last.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    pub execution_id: Uuid,
    /// Cursor state to pick up from
    pub branch: Branch,
}

// ---------------------------------------------------------------------------
// In-process run state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunState {
    /// Branches not yet ended, counted when spawned
    outstanding: usize,
    /// Output of the last node of every finished branch
    leaves: Map<String, Value>,
    /// `{node_id, error}` of every unhandled failure
    failures: Vec<Value>,
    /// Per-node execution counts, capped by `max_node_visits`
    visits: HashMap<String, u32>,
}

struct ExecutionRun {
    id: Uuid,
    workflow: Arc<Workflow>,
    user_id: String,
    depth: u32,
    context: Mutex<DataContext>,
    state: Mutex<RunState>,
    stopped: AtomicBool,
    done: watch::Sender<Option<ExecutionStatus>>,
}

/// Returned by [`ExecutionEngine::begin`]; resolves once the execution is terminal
#[derive(Debug)]
pub struct ExecutionHandle {
    pub id: Uuid,
    done: watch::Receiver<Option<ExecutionStatus>>,
}

impl ExecutionHandle {
    pub async fn finished(mut self) -> Option<ExecutionStatus> {
        self.done.wait_for(Option::is_some).await.ok().and_then(|s| *s)
    }
}

enum Step {
    /// Continue with these targets, in edge order; empty means the branch is terminal
    Next(Vec<String>),
    /// Re-run the same node
    Retry,
    /// Continuation has been handed off (delayed job or child watcher)
    Suspend,
    /// Node failed; subject to the nearest error_handler
    Fail(EngineError),
    /// Fails the whole execution
    Fatal(EngineError),
    /// Branch ended by an unhandled failure
    Dead,
}

enum BranchEnd {
    Finished,
    Suspended,
    Stopped,
}

macro_rules! step_try {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Step::Fail(e),
        }
    };
}

macro_rules! fatal_try {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Step::Fatal(e),
        }
    };
}

fn targets(workflow: &Workflow, from: &str, keep: impl Fn(&Edge) -> bool) -> Vec<String> {
    workflow
        .outgoing(from)
        .filter(|e| keep(e))
        .map(|e| e.to.clone())
        .collect()
}

fn start_nodes(workflow: &Workflow, start: Option<&str>) -> Result<Vec<String>, EngineError> {
    if let Some(id) = start {
        return match workflow.node(id) {
            Some(node) if node.node_type.is_trigger() => Ok(vec![id.to_string()]),
            _ => Err(EngineError::malformed(id, "start node is not a trigger of this workflow")),
        };
    }
    let manual: Vec<String> = workflow
        .triggers()
        .filter(|n| n.node_type == NodeType::TriggerManual)
        .map(|n| n.id.clone())
        .collect();
    if !manual.is_empty() {
        return Ok(manual);
    }
    Ok(workflow.triggers().map(|n| n.id.clone()).collect())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    dispatch: Arc<DispatchRegistry>,
    queue: JobQueue,
    limits: EngineConfig,
    runs: RwLock<HashMap<Uuid, Arc<ExecutionRun>>>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn Store>, dispatch: Arc<DispatchRegistry>, queue: JobQueue, limits: EngineConfig) -> Self {
        Self {
            store,
            dispatch,
            queue,
            limits,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Start a run of `workflow` and return its id as soon as the Execution
    /// record exists. Malformed graphs are rejected here and nothing is stored.
    pub async fn execute(&self, workflow: Workflow, seed: Value, owner: &str) -> Result<Uuid, EngineError> {
        let handle = self.begin(ExecutionRequest::new(workflow, seed).owned_by(owner)).await?;
        Ok(handle.id)
    }

    pub async fn begin(&self, request: ExecutionRequest) -> Result<ExecutionHandle, EngineError> {
        let ExecutionRequest {
            workflow,
            seed,
            user_id,
            start_node,
            parent,
        } = request;

        validate_graph(&workflow)?;
        let starts = start_nodes(&workflow, start_node.as_deref())?;
        let user_id = if user_id.is_empty() { workflow.user_id.clone() } else { user_id };

        let execution = Execution::started(&workflow.id, &user_id, parent.map(|p| p.execution_id));
        self.store.create_execution(&execution).await?;

        let mut context = DataContext::new(seed.clone());
        for start in &starts {
            context.set_output(start, seed.clone());
        }

        let (done, rx) = watch::channel(None);
        let run = Arc::new(ExecutionRun {
            id: execution.id,
            workflow: Arc::new(workflow),
            user_id,
            depth: parent.map(|p| p.depth).unwrap_or(0),
            context: Mutex::new(context),
            state: Mutex::new(RunState {
                outstanding: starts.len(),
                ..Default::default()
            }),
            stopped: AtomicBool::new(false),
            done,
        });
        self.runs.write().await.insert(run.id, Arc::clone(&run));

        info!(
            "▶️ Execution {} started for workflow '{}' ({} branch(es), depth {})",
            run.id,
            run.workflow.id,
            starts.len(),
            run.depth
        );

        for start in starts {
            let continuation = Continuation {
                execution_id: run.id,
                branch: Branch::at(start.clone()),
            };
            if let Err(e) = self.queue.enqueue(JobKind::Continue(continuation)) {
                if let Err(store_err) = self.fail_run(&run, Some(start.as_str()), &e).await {
                    error!("❌ Could not mark execution {} failed: {}", run.id, store_err);
                }
                self.runs.write().await.remove(&run.id);
                return Err(e);
            }
        }

        Ok(ExecutionHandle { id: run.id, done: rx })
    }

    /// Process one `Continue` job
    pub async fn resume(&self, continuation: Continuation) -> Result<(), EngineError> {
        let run = self.runs.read().await.get(&continuation.execution_id).cloned();
        let Some(run) = run else {
            warn!(
                "⚠️ No live state for execution {}; dropping branch at '{}'",
                continuation.execution_id, continuation.branch.cursor
            );
            self.store
                .finish_execution(
                    continuation.execution_id,
                    ExecutionStatus::Failed,
                    Value::Null,
                    Some("execution state lost".to_string()),
                )
                .await?;
            return Ok(());
        };

        self.drive(&run, continuation.branch).await;
        Ok(())
    }

    /// Administrative abort: marks the execution FAILED; running branches stop
    /// at their next node boundary. Returns `false` if it was already terminal.
    pub async fn abort(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let aborted = self
            .store
            .finish_execution(
                execution_id,
                ExecutionStatus::Failed,
                json!({ "aborted": true }),
                Some(EngineError::Aborted(execution_id).to_string()),
            )
            .await?;

        if aborted {
            info!("🛑 Execution {} aborted", execution_id);
            if let Some(run) = self.runs.read().await.get(&execution_id).cloned() {
                run.stopped.store(true, Ordering::SeqCst);
                notify(&run, ExecutionStatus::Failed);
            }
        }
        Ok(aborted)
    }

    /// A branch of `execution_id` can no longer be delivered. Its siblings
    /// would wait on it forever, so the whole execution is failed and its
    /// run state released.
    pub async fn abandon(&self, execution_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let message = format!("branch lost after repeated job failures: {reason}");
        let run = self.runs.write().await.remove(&execution_id);

        let result = match &run {
            Some(run) => {
                run.stopped.store(true, Ordering::SeqCst);
                let mut state = run.state.lock().await;
                state.failures.push(json!({ "node_id": null, "error": message }));
                json!({ "outputs": state.leaves, "failures": state.failures })
            }
            None => json!({ "outputs": {}, "failures": [{ "node_id": null, "error": message }] }),
        };

        if self
            .store
            .finish_execution(execution_id, ExecutionStatus::Failed, result, Some(message.clone()))
            .await?
        {
            error!("🪦 Execution {} abandoned: {}", execution_id, message);
        }
        if let Some(run) = run {
            notify(&run, ExecutionStatus::Failed);
        }
        Ok(())
    }

    /// Wait until the execution is terminal and return its stored record.
    /// Executions not owned by this process are polled.
    pub async fn wait_for(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let rx = self
            .runs
            .read()
            .await
            .get(&execution_id)
            .map(|run| run.done.subscribe());
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(Option::is_some).await;
        }

        loop {
            match self.store.get_execution(execution_id).await? {
                None => return Err(EngineError::NotFound(format!("execution {execution_id}"))),
                Some(execution) if execution.status.is_terminal() => return Ok(execution),
                Some(_) => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    }

    /// Number of executions with live in-process state
    pub async fn active_runs(&self) -> usize {
        self.runs.read().await.len()
    }

    // -----------------------------------------------------------------------
    // Branch driving
    // -----------------------------------------------------------------------

    async fn drive(&self, run: &Arc<ExecutionRun>, first: Branch) {
        let mut pending = vec![first];

        while let Some(branch) = pending.pop() {
            let mut spawned = Vec::new();
            let end = match self.run_branch(run, branch, &mut spawned).await {
                Ok(end) => end,
                Err(err) => {
                    error!("❌ Execution {} hit an internal error: {}", run.id, err);
                    if let Err(e) = self.fail_run(run, None, &err).await {
                        error!("❌ Could not mark execution {} failed: {}", run.id, e);
                    }
                    BranchEnd::Stopped
                }
            };

            pending.extend(spawned.into_iter().rev());

            match end {
                BranchEnd::Suspended => {}
                BranchEnd::Finished | BranchEnd::Stopped => self.branch_done(run).await,
            }
        }
    }

    async fn run_branch(
        &self,
        run: &Arc<ExecutionRun>,
        mut branch: Branch,
        spawned: &mut Vec<Branch>,
    ) -> Result<BranchEnd, EngineError> {
        let workflow = Arc::clone(&run.workflow);

        loop {
            if self.should_stop(run).await? {
                return Ok(BranchEnd::Stopped);
            }

            let Some(node) = workflow.node(&branch.cursor) else {
                let err = EngineError::malformed(&branch.cursor, "edge target missing from snapshot");
                self.fail_run(run, None, &err).await?;
                return Ok(BranchEnd::Stopped);
            };

            if branch.resume.is_none() {
                if let Err(err) = self.count_visit(run, &node.id).await {
                    self.fail_run(run, Some(node.id.as_str()), &err).await?;
                    return Ok(BranchEnd::Stopped);
                }
            }

            let mut step = match node.node_type.kind() {
                NodeKind::Trigger => Step::Next(targets(&workflow, &node.id, |_| true)),
                NodeKind::Action => self.run_action(run, node, &mut branch).await,
                NodeKind::Control => self.run_control(run, node, &mut branch).await,
            };
            if let Step::Fail(err) = step {
                step = self.handle_failure(run, node, &mut branch, err).await?;
            }

            match step {
                Step::Next(next) => {
                    branch.last = Some(node.id.clone());
                    let mut next = next.into_iter();
                    match next.next() {
                        Some(first) => {
                            let siblings: Vec<Branch> = next.map(|target| branch.sibling(target)).collect();
                            // Counted before this branch can enqueue a continuation of itself
                            if !siblings.is_empty() {
                                run.state.lock().await.outstanding += siblings.len();
                                spawned.extend(siblings);
                            }
                            branch.cursor = first;
                        }
                        None => {
                            // End of a loop body returns control to its loop node
                            if let Some(frame) = branch.frames.last() {
                                branch.cursor = frame.loop_id.clone();
                                continue;
                            }
                            self.record_leaf(run, &branch).await;
                            return Ok(BranchEnd::Finished);
                        }
                    }
                }
                Step::Retry => {}
                Step::Suspend => return Ok(BranchEnd::Suspended),
                Step::Dead => return Ok(BranchEnd::Finished),
                Step::Fail(err) | Step::Fatal(err) => {
                    self.fail_run(run, Some(node.id.as_str()), &err).await?;
                    return Ok(BranchEnd::Stopped);
                }
            }
        }
    }

    async fn run_action(&self, run: &ExecutionRun, node: &Node, branch: &mut Branch) -> Step {
        step_try!(params::require_fields(node));

        let doc = run.context.lock().await.document();
        let resolved = resolve(&node.params, &doc);
        let started = std::time::Instant::now();

        match self.dispatch.invoke(node, &resolved, &doc).await {
            Ok(output) => {
                run.context.lock().await.set_output(&node.id, output);
                branch.attempts.remove(&node.id);
                fatal_try!(
                    self.log(run, &node.id, LogLevel::Info, format!("{} node completed", node.node_type))
                        .await
                );
                info!("✅ Node '{}' completed in {:?} (execution {})", node.id, started.elapsed(), run.id);
                Step::Next(targets(&run.workflow, &node.id, |_| true))
            }
            Err(err) => Step::Fail(err),
        }
    }

    async fn run_control(&self, run: &ExecutionRun, node: &Node, branch: &mut Branch) -> Step {
        match node.node_type {
            NodeType::IfElse => self.run_if_else(run, node).await,
            NodeType::Switch => self.run_switch(run, node).await,
            NodeType::Loop => self.run_loop(run, node, branch).await,
            NodeType::Wait | NodeType::Delay => self.run_wait(run, node, branch).await,
            NodeType::SubWorkflow => self.run_sub_workflow(run, node, branch).await,
            NodeType::ErrorHandler => {
                let config = step_try!(ErrorHandlerConfig::from_node(node));
                branch.handlers.push(HandlerScope {
                    handler_id: node.id.clone(),
                });
                fatal_try!(
                    self.trace(run, node, format!("error policy '{:?}' active", config.action))
                        .await
                );
                Step::Next(targets(&run.workflow, &node.id, |e| !e.has_label(&config.branch_label)))
            }
            other => Step::Fail(EngineError::UnknownNodeType(other.to_string())),
        }
    }

    async fn run_if_else(&self, run: &ExecutionRun, node: &Node) -> Step {
        let config = step_try!(IfElseConfig::from_node(node));
        let outcome = {
            let mut ctx = run.context.lock().await;
            let outcome = evaluate_if_else(&config, &ctx.document());
            ctx.set_output(&node.id, json!({ "result": outcome }));
            outcome
        };
        fatal_try!(self.trace(run, node, format!("condition evaluated to {outcome}")).await);

        let label = if outcome { "true" } else { "false" };
        Step::Next(targets(&run.workflow, &node.id, |e| e.has_label(label)))
    }

    async fn run_switch(&self, run: &ExecutionRun, node: &Node) -> Step {
        let config = step_try!(SwitchConfig::from_node(node));
        let label = {
            let mut ctx = run.context.lock().await;
            let doc = ctx.document();
            let label = switch_label(&config, &doc);
            let value = to_text(&resolve(&config.expression, &doc));
            ctx.set_output(&node.id, json!({ "value": value, "case": label }));
            label
        };

        let mut next = match &label {
            Some(l) => targets(&run.workflow, &node.id, |e| e.has_label(l)),
            None => Vec::new(),
        };
        if next.is_empty() {
            next = targets(&run.workflow, &node.id, |e| e.label.is_none());
        }
        fatal_try!(
            self.trace(run, node, format!("matched case {}", label.as_deref().unwrap_or("<default>")))
                .await
        );
        Step::Next(next)
    }

    async fn run_loop(&self, run: &ExecutionRun, node: &Node, branch: &mut Branch) -> Step {
        let workflow = &run.workflow;
        let returning = branch
            .frames
            .last()
            .map(|f| f.loop_id == node.id)
            .unwrap_or(false);

        if !returning {
            let config = step_try!(LoopConfig::from_node(node));
            if config.iterations > self.limits.max_loop_iterations {
                return Step::Fatal(EngineError::LoopLimitExceeded {
                    node_id: node.id.clone(),
                    limit: self.limits.max_loop_iterations,
                });
            }
            run.context
                .lock()
                .await
                .set_output(&node.id, json!({ "index": 0, "iterations": [] }));

            let body = targets(workflow, &node.id, |e| e.has_label(LOOP_BODY_LABEL));
            if config.iterations == 0 || body.is_empty() {
                return Step::Next(targets(workflow, &node.id, |e| !e.has_label(LOOP_BODY_LABEL)));
            }
            branch.frames.push(LoopFrame {
                loop_id: node.id.clone(),
                index: 0,
                total: config.iterations,
            });
            fatal_try!(self.trace(run, node, format!("starting {} iteration(s)", config.iterations)).await);
            return Step::Next(body);
        }

        // An iteration just finished
        let (index, total) = match branch.frames.last_mut() {
            Some(frame) => {
                frame.index += 1;
                (frame.index, frame.total)
            }
            None => return Step::Next(Vec::new()),
        };
        {
            let mut ctx = run.context.lock().await;
            let produced = branch
                .last
                .as_deref()
                .and_then(|id| ctx.output(id).cloned())
                .unwrap_or(Value::Null);
            if let Some(Value::Object(state)) = ctx.output_mut(&node.id) {
                if let Some(Value::Array(iterations)) = state.get_mut("iterations") {
                    iterations.push(produced);
                }
                state.insert("index".to_string(), json!(index));
            }
        }

        if index < total {
            return Step::Next(targets(workflow, &node.id, |e| e.has_label(LOOP_BODY_LABEL)));
        }
        branch.frames.pop();
        fatal_try!(self.trace(run, node, format!("finished {total} iteration(s)")).await);
        Step::Next(targets(workflow, &node.id, |e| !e.has_label(LOOP_BODY_LABEL)))
    }

    async fn run_wait(&self, run: &ExecutionRun, node: &Node, branch: &mut Branch) -> Step {
        if matches!(branch.resume, Some(ResumeSignal::WaitElapsed)) {
            branch.resume = None;
            fatal_try!(self.trace(run, node, "resumed".to_string()).await);
            return Step::Next(targets(&run.workflow, &node.id, |_| true));
        }

        let config = step_try!(WaitConfig::from_node(node));
        let now = Utc::now();
        let resume_at = step_try!(config.resume_at(&node.id, now));
        run.context
            .lock()
            .await
            .set_output(&node.id, json!({ "resume_at": resume_at }));

        let delay = (resume_at - now).to_std().unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            return Step::Next(targets(&run.workflow, &node.id, |_| true));
        }

        fatal_try!(self.trace(run, node, format!("suspended until {}", resume_at.to_rfc3339())).await);
        let mut parked = branch.clone();
        parked.resume = Some(ResumeSignal::WaitElapsed);
        let continuation = Continuation {
            execution_id: run.id,
            branch: parked,
        };
        fatal_try!(self.queue.enqueue_after(JobKind::Continue(continuation), delay));
        debug!("⏳ Branch at '{}' of execution {} parked for {:?}", node.id, run.id, delay);
        Step::Suspend
    }

    async fn run_sub_workflow(&self, run: &ExecutionRun, node: &Node, branch: &mut Branch) -> Step {
        if let Some(ResumeSignal::ChildFinished {
            execution_id,
            status,
            result,
            error,
        }) = branch.resume.take()
        {
            run.context.lock().await.set_output(
                &node.id,
                json!({ "execution_id": execution_id, "status": status, "result": result }),
            );
            if status != ExecutionStatus::Completed {
                return Step::Fail(EngineError::Handler {
                    node_id: node.id.clone(),
                    message: format!(
                        "sub-workflow execution {} failed: {}",
                        execution_id,
                        error.unwrap_or_default()
                    ),
                });
            }
            fatal_try!(self.trace(run, node, format!("sub-workflow {execution_id} completed")).await);
            return Step::Next(targets(&run.workflow, &node.id, |_| true));
        }

        let config = step_try!(SubWorkflowConfig::from_node(node));
        let depth = run.depth + 1;
        if depth > self.limits.max_subworkflow_depth {
            return Step::Fatal(EngineError::SubWorkflowDepthExceeded {
                node_id: node.id.clone(),
                limit: self.limits.max_subworkflow_depth,
            });
        }

        let child = match self.store.get_workflow(&config.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => return Step::Fail(EngineError::NotFound(format!("workflow '{}'", config.workflow_id))),
            Err(e) => return Step::Fatal(e.into()),
        };

        let seed = {
            let ctx = run.context.lock().await;
            match &config.input {
                Some(input) => resolve(input, &ctx.document()),
                None => ctx.trigger.clone(),
            }
        };
        let request = ExecutionRequest {
            workflow: child,
            seed,
            user_id: run.user_id.clone(),
            start_node: None,
            parent: Some(ParentLink {
                execution_id: run.id,
                depth,
            }),
        };
        let handle = match self.begin(request).await {
            Ok(handle) => handle,
            Err(e) if e.is_execution_fatal() => return Step::Fatal(e),
            Err(e) => return Step::Fail(e),
        };
        let child_id = handle.id;

        if !config.wait_for_completion {
            run.context
                .lock()
                .await
                .set_output(&node.id, json!({ "execution_id": child_id }));
            fatal_try!(self.trace(run, node, format!("started sub-workflow {child_id}")).await);
            return Step::Next(targets(&run.workflow, &node.id, |_| true));
        }

        run.context
            .lock()
            .await
            .set_output(&node.id, json!({ "execution_id": child_id, "status": "RUNNING" }));
        fatal_try!(self.trace(run, node, format!("waiting for sub-workflow {child_id}")).await);

        // The watcher re-enqueues the branch once the child is terminal
        let mut parked = branch.clone();
        let queue = self.queue.clone();
        let store = Arc::clone(&self.store);
        let parent_id = run.id;
        tokio::spawn(async move {
            let status = handle.finished().await.unwrap_or(ExecutionStatus::Failed);
            let (result, error) = match store.get_execution(child_id).await {
                Ok(Some(child)) => (child.result, child.error),
                _ => (Value::Null, None),
            };
            parked.resume = Some(ResumeSignal::ChildFinished {
                execution_id: child_id,
                status,
                result,
                error,
            });
            let continuation = Continuation {
                execution_id: parent_id,
                branch: parked,
            };
            if let Err(e) = queue.enqueue(JobKind::Continue(continuation)) {
                error!("❌ Could not resume execution {} after child {}: {}", parent_id, child_id, e);
            }
        });
        Step::Suspend
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    async fn handle_failure(
        &self,
        run: &ExecutionRun,
        node: &Node,
        branch: &mut Branch,
        err: EngineError,
    ) -> Result<Step, EngineError> {
        if err.is_execution_fatal() {
            return Ok(Step::Fatal(err));
        }

        let scope = branch.handlers.len().checked_sub(1).and_then(|depth| {
            let handler_id = branch.handlers[depth].handler_id.clone();
            let handler = run.workflow.node(&handler_id)?;
            let policy = ErrorHandlerConfig::from_node(handler).ok()?;
            Some((depth, handler_id, policy))
        });
        let Some((depth, handler_id, policy)) = scope else {
            return self.unhandled(run, node, err).await;
        };

        let message = err.to_string();
        match policy.action {
            ErrorAction::Retry => {
                let used = branch.attempts.entry(node.id.clone()).or_insert(0);
                if err.is_retryable() && *used < policy.max_retries {
                    *used += 1;
                    let attempt = *used;
                    self.log(
                        run,
                        &node.id,
                        LogLevel::Warn,
                        format!("retry {}/{} after failure: {}", attempt, policy.max_retries, message),
                    )
                    .await?;
                    return Ok(Step::Retry);
                }
                branch.attempts.remove(&node.id);
                self.unhandled(run, node, err).await
            }
            ErrorAction::StopWorkflow => {
                warn!("🛑 Error handler '{}' stopped execution {}", handler_id, run.id);
                Ok(Step::Fatal(err))
            }
            ErrorAction::SendNotification => {
                let text = {
                    let mut ctx = run.context.lock().await;
                    ctx.set_output(&node.id, json!({ "error": message }));
                    match &policy.message {
                        Some(template) => to_text(&resolve_str(template, &ctx.document())),
                        None => message.clone(),
                    }
                };
                self.log(run, &node.id, LogLevel::Warn, format!("{handler_id}: {text}")).await?;
                Ok(Step::Next(targets(&run.workflow, &node.id, |_| true)))
            }
            ErrorAction::Branch => {
                run.context.lock().await.error = json!({
                    "node_id": node.id,
                    "message": message,
                    "handler": handler_id,
                });
                branch.handlers.truncate(depth);
                self.log(
                    run,
                    &node.id,
                    LogLevel::Warn,
                    format!("failure routed to '{}' path of {}: {}", policy.branch_label, handler_id, message),
                )
                .await?;
                Ok(Step::Next(targets(&run.workflow, &handler_id, |e| {
                    e.has_label(&policy.branch_label)
                })))
            }
        }
    }

    async fn unhandled(&self, run: &ExecutionRun, node: &Node, err: EngineError) -> Result<Step, EngineError> {
        let message = err.to_string();
        warn!("💥 Node '{}' failed in execution {}: {}", node.id, run.id, message);
        self.log(run, &node.id, LogLevel::Error, message.clone()).await?;
        run.state
            .lock()
            .await
            .failures
            .push(json!({ "node_id": node.id, "error": message }));
        Ok(Step::Dead)
    }

    /// Fail the whole execution right away; other branches stop at their next node
    async fn fail_run(&self, run: &ExecutionRun, node_id: Option<&str>, err: &EngineError) -> Result<(), EngineError> {
        run.stopped.store(true, Ordering::SeqCst);
        let message = err.to_string();

        if let Some(node_id) = node_id {
            self.log(run, node_id, LogLevel::Error, message.clone()).await?;
        }
        let result = {
            let mut state = run.state.lock().await;
            state
                .failures
                .push(json!({ "node_id": node_id, "error": message }));
            json!({ "outputs": state.leaves, "failures": state.failures })
        };

        if self
            .store
            .finish_execution(run.id, ExecutionStatus::Failed, result, Some(message.clone()))
            .await?
        {
            error!("💥 Execution {} failed: {}", run.id, message);
        }
        notify(run, ExecutionStatus::Failed);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    /// Checkpoint before every node: honours fatal stops and external aborts
    async fn should_stop(&self, run: &ExecutionRun) -> Result<bool, EngineError> {
        if run.stopped.load(Ordering::SeqCst) {
            return Ok(true);
        }
        match self.store.get_execution(run.id).await? {
            Some(execution) if execution.status.is_terminal() => {
                run.stopped.store(true, Ordering::SeqCst);
                notify(run, execution.status);
                info!("🛑 Execution {} is {}; stopping its branches", run.id, execution.status.as_str());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_visit(&self, run: &ExecutionRun, node_id: &str) -> Result<(), EngineError> {
        let mut state = run.state.lock().await;
        let visits = state.visits.entry(node_id.to_string()).or_insert(0);
        *visits += 1;
        if *visits > self.limits.max_node_visits {
            return Err(EngineError::LoopLimitExceeded {
                node_id: node_id.to_string(),
                limit: self.limits.max_node_visits,
            });
        }
        Ok(())
    }

    async fn record_leaf(&self, run: &ExecutionRun, branch: &Branch) {
        let Some(last) = branch.last.as_deref() else {
            return;
        };
        let output = run.context.lock().await.output(last).cloned().unwrap_or(Value::Null);
        run.state.lock().await.leaves.insert(last.to_string(), output);
    }

    async fn branch_done(&self, run: &ExecutionRun) {
        let remaining = {
            let mut state = run.state.lock().await;
            state.outstanding = state.outstanding.saturating_sub(1);
            state.outstanding
        };
        if remaining == 0 {
            self.finalize(run).await;
        }
    }

    async fn finalize(&self, run: &ExecutionRun) {
        // Released before waiters are woken
        self.runs.write().await.remove(&run.id);
        debug!("🧹 Released run state of execution {}", run.id);

        if !run.stopped.load(Ordering::SeqCst) {
            let (result, error) = {
                let state = run.state.lock().await;
                let error = state
                    .failures
                    .first()
                    .and_then(|f| f.get("error"))
                    .map(to_text);
                (json!({ "outputs": state.leaves, "failures": state.failures }), error)
            };
            let status = if error.is_some() {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };

            match self.store.finish_execution(run.id, status, result, error).await {
                Ok(true) => {
                    info!("🏁 Execution {} finished: {}", run.id, status.as_str());
                    notify(run, status);
                }
                Ok(false) => {
                    let actual = match self.store.get_execution(run.id).await {
                        Ok(Some(execution)) => execution.status,
                        _ => ExecutionStatus::Failed,
                    };
                    notify(run, actual);
                }
                Err(e) => {
                    error!("❌ Could not record the outcome of execution {}: {}", run.id, e);
                    notify(run, ExecutionStatus::Failed);
                }
            }
        } else {
            notify(run, ExecutionStatus::Failed);
        }
    }

    async fn log(&self, run: &ExecutionRun, node_id: &str, level: LogLevel, message: String) -> Result<(), EngineError> {
        self.store
            .append_log(&ExecutionLog {
                execution_id: run.id,
                node_id: node_id.to_string(),
                timestamp: Utc::now(),
                level,
                message,
            })
            .await?;
        Ok(())
    }

    /// Debug-level log entry for control-flow decisions
    async fn trace(&self, run: &ExecutionRun, node: &Node, message: String) -> Result<(), EngineError> {
        self.log(run, &node.id, LogLevel::Debug, format!("{}: {}", node.node_type, message))
            .await
    }
}

fn notify(run: &ExecutionRun, status: ExecutionStatus) {
    run.done.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(status);
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(nodes: Vec<Node>) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: String::new(),
            user_id: "u1".into(),
            nodes,
            edges: vec![Edge::new("a", "b")],
            active: true,
        }
    }

    #[test]
    fn manual_triggers_win_when_no_start_given() {
        let workflow = wf(vec![
            Node::new("a", NodeType::TriggerManual, Value::Null),
            Node::new("cron", NodeType::TriggerSchedule, json!({ "cron": "0 * * * *" })),
            Node::new("b", NodeType::Wait, json!({ "seconds": 0 })),
        ]);
        assert_eq!(start_nodes(&workflow, None).unwrap(), vec!["a"]);
        assert_eq!(start_nodes(&workflow, Some("cron")).unwrap(), vec!["cron"]);
        assert!(start_nodes(&workflow, Some("b")).is_err());
    }

    #[test]
    fn siblings_drop_loop_frames() {
        let mut branch = Branch::at("x");
        branch.frames.push(LoopFrame { loop_id: "l".into(), index: 1, total: 3 });
        branch.handlers.push(HandlerScope { handler_id: "guard".into() });
        let sibling = branch.sibling("y".into());
        assert!(sibling.frames.is_empty());
        assert_eq!(sibling.handlers.len(), 1);
    }

    #[test]
    fn continuations_survive_serialization() {
        let mut branch = Branch::at("wait");
        branch.resume = Some(ResumeSignal::WaitElapsed);
        let cont = Continuation { execution_id: Uuid::new_v4(), branch };
        let back: Continuation = serde_json::from_value(serde_json::to_value(&cont).unwrap()).unwrap();
        assert!(matches!(back.branch.resume, Some(ResumeSignal::WaitElapsed)));
        assert_eq!(back.branch.cursor, "wait");
    }
}
