/// Runtime Execution Engine
///
/// Everything that happens after a workflow is saved:
/// - Queue-driven graph execution with branching, loops, waits and sub-workflows
/// - Action dispatch guarded by per-target circuit breakers
/// - Template resolution against the execution data context
/// - Cron scheduling and webhook ingestion feeding the job queue

pub mod breaker;
pub mod conditions;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod ingest;
pub mod queue;
pub mod scheduler;
pub mod worker;

// Re-export main types
pub use breaker::{BreakerRegistry, BreakerSettings, BreakerState, CircuitBreaker};
pub use context::DataContext;
pub use dispatch::{DispatchRegistry, NodeHandler};
pub use engine::{ExecutionEngine, ExecutionHandle, ExecutionRequest};
pub use ingest::{WebhookIngestor, SIGNATURE_HEADER};
pub use queue::{Job, JobEvent, JobKind, JobOutcome, JobProcessor, JobQueue, WorkerPool};
pub use scheduler::{Scheduler, SchedulerService, TickReport};
pub use worker::WorkflowJobProcessor;
