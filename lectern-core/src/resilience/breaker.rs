use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerSection;
use crate::sync::lock;

pub const COMPLETION_WRITE_OPERATION: &str = "video-completion-write";
pub const PROGRESS_WRITE_OPERATION: &str = "video-progress-write";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_for: Duration,
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(60),
            half_open_successes: 3,
        }
    }
}

impl From<&BreakerSection> for CircuitBreakerConfig {
    fn from(section: &BreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold.max(1),
            open_for: Duration::from_secs(section.open_for_seconds),
            half_open_successes: section.half_open_successes.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub state: CircuitState,
    pub last_failure_at: Option<Instant>,
    pub half_open_success_count: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            failure_count: 0,
            state: CircuitState::Closed,
            last_failure_at: None,
            half_open_success_count: 0,
        }
    }
}

/// Result of routing an operation through a breaker.
#[derive(Debug)]
pub enum BreakerOutcome<T, E> {
    /// The breaker was open; the operation was never started.
    Rejected,
    Completed(Result<T, E>),
}

impl<T, E> BreakerOutcome<T, E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BreakerOutcome::Rejected)
    }
}

enum CircuitDecision {
    Proceed,
    ShortCircuit,
}

struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitBreakerState::default(),
        }
    }

    fn cooled_down(&self, now: Instant) -> bool {
        match self.state.last_failure_at {
            Some(at) => now.saturating_duration_since(at) >= self.config.open_for,
            None => true,
        }
    }

    fn before_call(&mut self, now: Instant) -> CircuitDecision {
        match self.state.state {
            CircuitState::Closed | CircuitState::HalfOpen => CircuitDecision::Proceed,
            CircuitState::Open => {
                if self.cooled_down(now) {
                    self.state.state = CircuitState::HalfOpen;
                    self.state.half_open_success_count = 0;
                    CircuitDecision::Proceed
                } else {
                    CircuitDecision::ShortCircuit
                }
            }
        }
    }

    fn would_allow(&self, now: Instant) -> bool {
        match self.state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.cooled_down(now),
        }
    }

    /// Returns the new state when the record caused a transition.
    fn record(&mut self, now: Instant, success: bool) -> Option<CircuitState> {
        match self.state.state {
            CircuitState::Closed => {
                if success {
                    self.state.failure_count = 0;
                    None
                } else {
                    self.state.failure_count = self.state.failure_count.saturating_add(1);
                    self.state.last_failure_at = Some(now);
                    if self.state.failure_count >= self.config.failure_threshold {
                        self.trip(now);
                        Some(CircuitState::Open)
                    } else {
                        None
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.state.half_open_success_count =
                        self.state.half_open_success_count.saturating_add(1);
                    if self.state.half_open_success_count >= self.config.half_open_successes {
                        self.state = CircuitBreakerState::default();
                        Some(CircuitState::Closed)
                    } else {
                        None
                    }
                } else {
                    self.state.failure_count = self.state.failure_count.saturating_add(1);
                    self.trip(now);
                    Some(CircuitState::Open)
                }
            }
            // A call admitted before the breaker tripped finished late.
            CircuitState::Open => {
                if !success {
                    self.state.last_failure_at = Some(now);
                }
                None
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state.state = CircuitState::Open;
        self.state.last_failure_at = Some(now);
        self.state.half_open_success_count = 0;
    }
}

/// Process-wide set of breakers keyed by logical operation name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Runs `operation` unless the breaker for `key` is open.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, operation: F) -> BreakerOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let CircuitDecision::ShortCircuit = self.before_call(key) {
            warn!(target: "breaker", operation = key, "circuit open, skipping call");
            return BreakerOutcome::Rejected;
        }
        let result = operation().await;
        self.record(key, result.is_ok());
        BreakerOutcome::Completed(result)
    }

    /// Whether a call for `key` would currently be admitted, without
    /// transitioning the breaker.
    pub fn allows(&self, key: &str) -> bool {
        let breakers = lock(&self.breakers);
        breakers
            .get(key)
            .map(|breaker| breaker.would_allow(Instant::now()))
            .unwrap_or(true)
    }

    pub fn snapshot(&self, key: &str) -> CircuitBreakerState {
        let breakers = lock(&self.breakers);
        breakers
            .get(key)
            .map(|breaker| breaker.state.clone())
            .unwrap_or_default()
    }

    pub fn reset(&self, key: &str) {
        let mut breakers = lock(&self.breakers);
        breakers.remove(key);
    }

    fn before_call(&self, key: &str) -> CircuitDecision {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        let was_open = breaker.state.state == CircuitState::Open;
        let decision = breaker.before_call(Instant::now());
        if was_open && breaker.state.state == CircuitState::HalfOpen {
            info!(target: "breaker", operation = key, "cooldown elapsed, probing (half-open)");
        }
        decision
    }

    fn record(&self, key: &str, success: bool) {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        match breaker.record(Instant::now(), success) {
            Some(CircuitState::Open) => {
                warn!(
                    target: "breaker",
                    operation = key,
                    failures = breaker.state.failure_count,
                    "circuit opened"
                );
            }
            Some(CircuitState::Closed) => {
                info!(target: "breaker", operation = key, "circuit closed");
            }
            _ => {}
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OP: &str = "test-op";

    async fn fail(registry: &CircuitBreakerRegistry) -> BreakerOutcome<(), String> {
        registry
            .execute(OP, || async { Err::<(), _>("boom".to_string()) })
            .await
    }

    async fn succeed(registry: &CircuitBreakerRegistry) -> BreakerOutcome<(), String> {
        registry.execute(OP, || async { Ok::<_, String>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..5 {
            assert!(!fail(&registry).await.is_rejected());
        }
        assert_eq!(registry.snapshot(OP).state, CircuitState::Open);
        assert!(!registry.allows(OP));

        let calls = AtomicUsize::new(0);
        let outcome = registry
            .execute(OP, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(outcome.is_rejected());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout_then_closes_after_three_successes() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..5 {
            fail(&registry).await;
        }
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(succeed(&registry).await.is_rejected());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.allows(OP));
        assert!(!succeed(&registry).await.is_rejected());
        let state = registry.snapshot(OP);
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.half_open_success_count, 1);

        succeed(&registry).await;
        succeed(&registry).await;
        let state = registry.snapshot(OP);
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.half_open_success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_half_open_reopens_immediately() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..5 {
            fail(&registry).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        succeed(&registry).await;
        fail(&registry).await;
        assert_eq!(registry.snapshot(OP).state, CircuitState::Open);
        assert!(succeed(&registry).await.is_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_failure_count() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..4 {
            fail(&registry).await;
        }
        assert_eq!(registry.snapshot(OP).failure_count, 4);
        succeed(&registry).await;
        assert_eq!(registry.snapshot(OP).failure_count, 0);
        for _ in 0..4 {
            fail(&registry).await;
        }
        assert_eq!(registry.snapshot(OP).state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn breakers_are_keyed_per_operation() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        fail(&registry).await;
        assert!(!registry.allows(OP));
        assert!(registry.allows("other-op"));
        registry.reset(OP);
        assert_eq!(registry.snapshot(OP), CircuitBreakerState::default());
    }
}
