use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::LecternConfig;
use crate::metrics::PerformanceData;
use crate::progress::UnitRef;
use crate::resilience::{BreakerOutcome, CircuitBreakerRegistry, COMPLETION_WRITE_OPERATION};
use crate::sync::lock;

use super::models::{
    CompletionAttemptState, CompletionKey, CompletionOutcome, CompletionPhase, CompletionReason,
    CompletionRecord, CompletionSnapshot, UserIdentity,
};
use super::store::CompletionWriter;
use super::CompletionError;

/// Shown to the user for any failed or skipped write, whatever the cause.
pub const SAVE_FAILED_MESSAGE: &str = "failed to save completion";

#[derive(Debug, Clone, PartialEq)]
pub struct PersistencePolicy {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_jitter: Duration,
    pub saving_timeout: Duration,
    pub override_threshold_percent: f64,
}

impl PersistencePolicy {
    pub fn from_config(config: &LecternConfig) -> Self {
        Self {
            max_attempts: config.persistence.max_attempts.max(1),
            retry_backoff: config.persistence.retry_backoff(),
            retry_jitter: Duration::from_millis(config.persistence.retry_jitter_ms),
            saving_timeout: config.persistence.saving_timeout(),
            override_threshold_percent: config.completion.override_threshold_percent,
        }
    }

    fn retry_delay(&self) -> Duration {
        let jitter_ms = self.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            self.retry_backoff
        } else {
            self.retry_backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        }
    }
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self::from_config(&LecternConfig::default())
    }
}

#[derive(Debug)]
struct ControllerState {
    phase: CompletionPhase,
    attempt: CompletionAttemptState,
    watch_percentage: f64,
    completed_at: Option<DateTime<Utc>>,
}

impl ControllerState {
    fn refresh_override(&mut self, threshold: f64) {
        self.attempt.can_manual_override = self.phase != CompletionPhase::Completed
            && !self.attempt.is_processing
            && self.watch_percentage >= threshold;
    }
}

struct Shared {
    key: Option<CompletionKey>,
    writer: Arc<dyn CompletionWriter>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: PersistencePolicy,
    state: Mutex<ControllerState>,
    metrics: Arc<Mutex<PerformanceData>>,
    alive: AtomicBool,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

/// Guards the durable completion write of one unit session: one write in
/// flight at a time, bounded automatic retries, and a manual override once
/// the video is nearly watched.
#[derive(Clone)]
pub struct CompletionController {
    shared: Arc<Shared>,
}

impl fmt::Debug for CompletionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionController")
            .field("key", &self.shared.key)
            .field("policy", &self.shared.policy)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CompletionController {
    pub fn new(
        user: Option<&UserIdentity>,
        unit: &UnitRef,
        writer: Arc<dyn CompletionWriter>,
        breakers: Arc<CircuitBreakerRegistry>,
        policy: PersistencePolicy,
        metrics: Arc<Mutex<PerformanceData>>,
    ) -> Self {
        let state = ControllerState {
            phase: CompletionPhase::Idle,
            attempt: CompletionAttemptState::default(),
            watch_percentage: 0.0,
            completed_at: None,
        };
        Self {
            shared: Arc::new(Shared {
                key: user.map(|user| CompletionKey::new(user, unit)),
                writer,
                breakers,
                policy,
                state: Mutex::new(state),
                metrics,
                alive: AtomicBool::new(true),
                retry_task: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> Option<&CompletionKey> {
        self.shared.key.as_ref()
    }

    pub fn phase(&self) -> CompletionPhase {
        lock(&self.shared.state).phase
    }

    pub fn attempt_state(&self) -> CompletionAttemptState {
        lock(&self.shared.state).attempt.clone()
    }

    pub fn snapshot(&self) -> CompletionSnapshot {
        let state = lock(&self.shared.state);
        CompletionSnapshot {
            phase: state.phase,
            attempt: state.attempt.clone(),
            completed_at: state.completed_at,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == CompletionPhase::Completed
    }

    pub fn is_closed(&self) -> bool {
        !self.shared.alive.load(Ordering::SeqCst)
    }

    /// Feeds the latest watch percentage; it only ever moves up.
    pub fn update_watch_percentage(&self, percentage: f64) {
        let mut state = lock(&self.shared.state);
        if percentage.is_finite() && percentage > state.watch_percentage {
            state.watch_percentage = percentage.min(100.0);
        }
        state.refresh_override(self.shared.policy.override_threshold_percent);
    }

    pub async fn on_completion_intent(&self) -> CompletionOutcome {
        lock(&self.shared.metrics).record_intent();
        Shared::attempt(&self.shared, CompletionReason::Auto).await
    }

    /// User-triggered completion that bypasses the automatic retry budget.
    pub async fn force_complete(&self) -> CompletionOutcome {
        Shared::attempt(&self.shared, CompletionReason::Manual).await
    }

    /// Single entry point shared by automatic completion, retries and manual
    /// override.
    pub async fn attempt_completion(&self, reason: CompletionReason) -> CompletionOutcome {
        Shared::attempt(&self.shared, reason).await
    }

    /// Cancels pending retries; results of in-flight writes are discarded.
    pub fn close(&self) {
        if !self.shared.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = lock(&self.shared.retry_task).take() {
            handle.abort();
        }
        debug!(target: "completion", key = ?self.shared.key, "completion controller closed");
    }
}

impl Shared {
    fn attempt(this: &Arc<Self>, reason: CompletionReason) -> BoxFuture<'static, CompletionOutcome> {
        let shared = Arc::clone(this);
        Box::pin(async move { shared.run_attempt(reason).await })
    }

    async fn run_attempt(self: Arc<Self>, reason: CompletionReason) -> CompletionOutcome {
        if !self.alive.load(Ordering::SeqCst) {
            return CompletionOutcome::Cancelled;
        }
        let Some(key) = self.key.clone() else {
            debug!(target: "completion", "no authenticated user, completion write skipped");
            return CompletionOutcome::Unauthenticated;
        };

        let attempt_number = {
            let mut state = lock(&self.state);
            if state.phase == CompletionPhase::Completed {
                return CompletionOutcome::AlreadyCompleted;
            }
            if state.attempt.is_processing {
                lock(&self.metrics).record_dropped_intent();
                debug!(target: "completion", %key, "write already in flight, dropping request");
                return CompletionOutcome::Dropped;
            }
            match reason {
                CompletionReason::Auto => {
                    if state.attempt.attempts_count >= self.policy.max_attempts {
                        return CompletionOutcome::Exhausted;
                    }
                }
                CompletionReason::Manual => {
                    if !state.attempt.can_manual_override {
                        return CompletionOutcome::OverrideUnavailable;
                    }
                }
            }
            state.phase = CompletionPhase::Saving;
            state.attempt.is_processing = true;
            state.attempt.attempts_count = state.attempt.attempts_count.saturating_add(1);
            state.attempt.can_manual_override = false;
            state.attempt.attempts_count
        };

        let record = CompletionRecord::completed_now(&key, reason);
        let writer = Arc::clone(&self.writer);
        let saving_timeout = self.policy.saving_timeout;
        let started = Instant::now();
        let outcome = self
            .breakers
            .execute(COMPLETION_WRITE_OPERATION, || async move {
                match timeout(saving_timeout, writer.write_completion(&record)).await {
                    Ok(result) => result.map(|()| record.completed_at),
                    Err(_) => Err(CompletionError::Timeout(saving_timeout)),
                }
            })
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !self.alive.load(Ordering::SeqCst) {
            debug!(target: "completion", %key, "session closed before write finished");
            return CompletionOutcome::Cancelled;
        }

        match outcome {
            BreakerOutcome::Rejected => {
                {
                    let mut state = lock(&self.state);
                    state.phase = CompletionPhase::Error;
                    state.attempt.is_processing = false;
                    state.attempt.attempts_count = state.attempt.attempts_count.saturating_sub(1);
                    state.attempt.last_error = Some(SAVE_FAILED_MESSAGE.to_string());
                    state.refresh_override(self.policy.override_threshold_percent);
                }
                lock(&self.metrics).record_rejected_write();
                warn!(target: "completion", %key, %reason, "completion write skipped, circuit open");
                CompletionOutcome::Skipped
            }
            BreakerOutcome::Completed(Ok(completed_at)) => {
                {
                    let mut state = lock(&self.state);
                    state.phase = CompletionPhase::Completed;
                    state.attempt.is_processing = false;
                    state.attempt.last_error = None;
                    state.completed_at = Some(completed_at);
                    state.refresh_override(self.policy.override_threshold_percent);
                }
                lock(&self.metrics).record_write(true, latency_ms);
                info!(
                    target: "completion",
                    %key,
                    %reason,
                    attempt = attempt_number,
                    "unit completion saved"
                );
                CompletionOutcome::Completed { completed_at }
            }
            BreakerOutcome::Completed(Err(err)) => {
                let error = err.to_string();
                let attempts = {
                    let mut state = lock(&self.state);
                    state.phase = CompletionPhase::Error;
                    state.attempt.is_processing = false;
                    state.attempt.last_error = Some(error.clone());
                    state.refresh_override(self.policy.override_threshold_percent);
                    state.attempt.attempts_count
                };
                lock(&self.metrics).record_write(false, latency_ms);

                let retry_scheduled = reason == CompletionReason::Auto
                    && attempts < self.policy.max_attempts
                    && self.breakers.allows(COMPLETION_WRITE_OPERATION);
                if retry_scheduled {
                    self.schedule_retry();
                }
                warn!(
                    target: "completion",
                    %key,
                    %reason,
                    attempt = attempts,
                    max_attempts = self.policy.max_attempts,
                    retry_scheduled,
                    "completion write failed: {error}"
                );
                CompletionOutcome::Failed {
                    error,
                    retry_scheduled,
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let delay = self.policy.retry_delay();
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if shared.alive.load(Ordering::SeqCst) {
                Shared::attempt(&shared, CompletionReason::Auto).await;
            }
        });
        lock(&self.metrics).record_retry();
        *lock(&self.retry_task) = Some(handle);
    }
}
