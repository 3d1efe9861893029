/// Circuit breaker
///
/// One breaker per guarded target ("slack", "http", ...). Each call outcome is
/// recorded under a single mutex acquisition, so concurrent workers never
/// interleave a read-modify-write of the counters. The registry itself uses
/// `ArcSwap` for lock-free lookups on the hot path.

use crate::error::EngineError;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures needed to trip (together with `volume_threshold`)
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes needed to close again
    pub success_threshold: u32,
    /// How long OPEN lasts after the last failure
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Minimum recorded requests before the breaker may trip
    pub volume_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            volume_threshold: 10,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    requests: u32,
    last_failure: Option<Instant>,
}

impl Inner {
    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.requests = 0;
        self.last_failure = None;
    }
}

/// Point-in-time view of a breaker, for logs and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub requests: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            target: target.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                requests: 0,
                last_failure: None,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters stay consistent even if a holder panicked; every update is a
        // complete state transition.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            requests: inner.requests,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Admission check. OPEN rejects until `timeout` has passed since the last
    /// failure; the first caller after that moves the breaker to HALF_OPEN.
    pub fn try_acquire(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed() >= self.settings.timeout)
                .unwrap_or(true);
            if !elapsed {
                return Err(EngineError::CircuitOpen {
                    target: self.target.clone(),
                });
            }
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
            tracing::info!("🟡 Circuit for '{}' is half-open", self.target);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.requests = inner.requests.saturating_add(1);
        inner.consecutive_failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.settings.success_threshold {
                inner.state = BreakerState::Closed;
                inner.reset();
                tracing::info!("🟢 Circuit for '{}' closed", self.target);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.requests = inner.requests.saturating_add(1);
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!("🔴 Circuit for '{}' re-opened after a trial failure", self.target);
            }
            BreakerState::Closed
                if inner.requests >= self.settings.volume_threshold
                    && inner.consecutive_failures >= self.settings.failure_threshold =>
            {
                inner.state = BreakerState::Open;
                tracing::warn!(
                    "🔴 Circuit for '{}' opened ({} consecutive failures over {} requests)",
                    self.target,
                    inner.consecutive_failures,
                    inner.requests
                );
            }
            _ => {}
        }
    }

    /// Run `call` through the breaker. `call` is not polled at all while OPEN.
    pub async fn call<T, E, F, Fut>(&self, call: F) -> Result<Result<T, E>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        let outcome = call().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        Ok(outcome)
    }
}

/// Process-wide map of breakers, created lazily per target
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: ArcSwap<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.load().get(target) {
            return Arc::clone(existing);
        }

        // Copy-on-write insert; `rcu` retries if another worker raced us, and the
        // final lookup returns whichever breaker won.
        let settings = self.settings;
        self.breakers.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(target, settings)));
            next
        });

        match self.breakers.load().get(target) {
            Some(breaker) => Arc::clone(breaker),
            None => Arc::new(CircuitBreaker::new(target, settings)),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .load()
            .iter()
            .map(|(target, breaker)| (target.clone(), breaker.snapshot()))
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
