/// flowmesh: workflow automation engine
///
/// Users compose directed graphs of typed nodes (triggers, conditionals, loops,
/// external-service calls); flowmesh runs them on demand, on a cron schedule or
/// when a webhook arrives, through a job queue and a worker pool.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Workflow model layer - definitions, parameter schemas, validation, trigger derivation
pub mod workflow;

// Persistence - Store trait with sqlite and in-memory backends
pub mod store;

// Runtime - engine, queue, workers, breakers, scheduler, webhook ingestion
pub mod runtime;

// Built-in node handlers
pub mod nodes;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::EngineError;
pub use runtime::{ExecutionEngine, ExecutionRequest};
pub use server::start_server;
pub use workflow::{Edge, Node, NodeType, Workflow};
