/// Workflow Model Layer
///
/// This module handles workflow definitions and everything that can be checked
/// without running them:
/// - Type definitions (Workflow, Node, NodeType, Edge)
/// - Per-node-type parameter schemas and typed control-flow configs
/// - Structural validation (petgraph reachability)
/// - Deriving schedules and webhooks from trigger nodes

// Core workflow type definitions
pub mod types;

// Parameter schemas and typed configs for control-flow nodes
pub mod params;

// Structural graph validation
pub mod validator;

// Schedule/webhook derivation from trigger nodes
pub mod triggers;

// Re-export commonly used types
pub use types::{Edge, Node, NodeKind, NodeType, Workflow};
pub use validator::{validate_graph, validate_workflow};
