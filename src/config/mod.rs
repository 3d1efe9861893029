/// Configuration management for the flowmesh engine
///
/// Handles server configuration, database connection, engine guards, worker pool,
/// scheduler cadence, circuit-breaker thresholds and integration credentials.
/// Every value can be overridden with a `FLOWMESH_*` environment variable.

use crate::runtime::breaker::BreakerSettings;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Runaway-execution guards
    pub engine: EngineConfig,
    /// Worker pool and redelivery policy
    pub queue: QueueConfig,
    /// Cron tick cadence
    pub scheduler: SchedulerConfig,
    /// Defaults for every per-target circuit breaker
    pub breaker: BreakerSettings,
    /// Credentials and timeouts for built-in node handlers
    pub integrations: IntegrationsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection url (e.g., "sqlite://data/flowmesh.db", "sqlite::memory:")
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Largest `iterations` a loop node may declare
    pub max_loop_iterations: u32,
    /// Deepest sub_workflow nesting; the root execution is depth 0
    pub max_subworkflow_depth: u32,
    /// Per-node visit ceiling within one execution (guards cycles outside loops)
    pub max_node_visits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 1000,
            max_subworkflow_depth: 5,
            max_node_visits: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Deliveries per job before it's dropped
    pub max_attempts: u32,
    /// First redelivery delay; doubles on every further attempt
    pub backoff_ms: u64,
}

impl QueueConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    /// Bot token used by `slack_send`; the handler is only registered when set
    pub slack_token: Option<String>,
    /// Slack Web API root override (proxy or self-hosted gateway)
    pub slack_api_url: Option<String>,
    /// Timeout applied to every outbound HTTP call
    pub http_timeout_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let engine = EngineConfig::default();
        let queue = QueueConfig::default();
        let breaker = BreakerSettings::default();

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWMESH_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWMESH_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWMESH_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowmesh.db".to_string()),
            },
            engine: EngineConfig {
                max_loop_iterations: env_or("FLOWMESH_MAX_LOOP_ITERATIONS", engine.max_loop_iterations),
                max_subworkflow_depth: env_or("FLOWMESH_MAX_SUBWORKFLOW_DEPTH", engine.max_subworkflow_depth),
                max_node_visits: env_or("FLOWMESH_MAX_NODE_VISITS", engine.max_node_visits),
            },
            queue: QueueConfig {
                workers: env_or("FLOWMESH_WORKERS", queue.workers),
                max_attempts: env_or("FLOWMESH_JOB_MAX_ATTEMPTS", queue.max_attempts),
                backoff_ms: env_or("FLOWMESH_JOB_BACKOFF_MS", queue.backoff_ms),
            },
            scheduler: SchedulerConfig {
                tick_secs: env_or("FLOWMESH_SCHEDULER_TICK_SECS", 60),
            },
            breaker: BreakerSettings {
                failure_threshold: env_or("FLOWMESH_BREAKER_FAILURE_THRESHOLD", breaker.failure_threshold),
                success_threshold: env_or("FLOWMESH_BREAKER_SUCCESS_THRESHOLD", breaker.success_threshold),
                timeout: Duration::from_secs(env_or(
                    "FLOWMESH_BREAKER_TIMEOUT_SECS",
                    breaker.timeout.as_secs(),
                )),
                volume_threshold: env_or("FLOWMESH_BREAKER_VOLUME_THRESHOLD", breaker.volume_threshold),
            },
            integrations: IntegrationsConfig {
                slack_token: std::env::var("FLOWMESH_SLACK_TOKEN").ok().filter(|t| !t.is_empty()),
                slack_api_url: std::env::var("FLOWMESH_SLACK_API_URL").ok().filter(|u| !u.is_empty()),
                http_timeout_secs: env_or("FLOWMESH_HTTP_TIMEOUT_SECS", 30),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let queue = QueueConfig { workers: 1, max_attempts: 4, backoff_ms: 100 };
        assert_eq!(queue.backoff(1), Duration::from_millis(100));
        assert_eq!(queue.backoff(2), Duration::from_millis(200));
        assert_eq!(queue.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("FLOWMESH_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_or::<u16>("FLOWMESH_TEST_GARBAGE_PORT", 3004), 3004);
        assert_eq!(env_or::<u32>("FLOWMESH_TEST_UNSET_VALUE", 7), 7);
    }
}
