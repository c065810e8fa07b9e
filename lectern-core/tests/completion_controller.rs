use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lectern_core::completion::SAVE_FAILED_MESSAGE;
use lectern_core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CompletionController,
    CompletionError, CompletionKey, CompletionOutcome, CompletionPhase, CompletionReason,
    CompletionRecord, CompletionResult, CompletionWriter, PerformanceData, PersistencePolicy,
    ProgressRecord, UnitRef, UserIdentity, COMPLETION_WRITE_OPERATION,
};
use tokio::sync::Semaphore;
use tokio::time::sleep;

#[derive(Default)]
struct ScriptedWriter {
    failures_remaining: Mutex<u32>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Option<Semaphore>,
    hang: bool,
    written: Mutex<Vec<CompletionRecord>>,
}

impl ScriptedWriter {
    fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: Mutex::new(times),
            ..Self::default()
        })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            hang: true,
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl CompletionWriter for ScriptedWriter {
    async fn write_completion(&self, record: &CompletionRecord) -> CompletionResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.failures_remaining.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(CompletionError::Backend("database unavailable".into()));
        }
        self.written.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn load_completion(
        &self,
        _key: &CompletionKey,
    ) -> CompletionResult<Option<CompletionRecord>> {
        Ok(None)
    }

    async fn write_progress(&self, _record: &ProgressRecord) -> CompletionResult<()> {
        Ok(())
    }
}

struct Harness {
    controller: CompletionController,
    metrics: Arc<Mutex<PerformanceData>>,
    breakers: Arc<CircuitBreakerRegistry>,
}

fn harness(writer: Arc<ScriptedWriter>) -> Harness {
    harness_with(writer, CircuitBreakerRegistry::default(), PersistencePolicy::default())
}

fn harness_with(
    writer: Arc<ScriptedWriter>,
    breakers: CircuitBreakerRegistry,
    policy: PersistencePolicy,
) -> Harness {
    let metrics = Arc::new(Mutex::new(PerformanceData::default()));
    let breakers = Arc::new(breakers);
    let controller = CompletionController::new(
        Some(&UserIdentity::new("learner-1")),
        &UnitRef::new("unit-1", "course-1"),
        writer,
        Arc::clone(&breakers),
        policy,
        Arc::clone(&metrics),
    );
    Harness {
        controller,
        metrics,
        breakers,
    }
}

async fn wait_for_calls(writer: &ScriptedWriter, calls: usize) {
    while writer.calls() < calls {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn fail_fail_succeed_completes_on_third_attempt() {
    let writer = ScriptedWriter::failing(2);
    let h = harness(writer.clone());
    h.controller.update_watch_percentage(96.0);

    let outcome = h.controller.on_completion_intent().await;
    assert!(matches!(
        outcome,
        CompletionOutcome::Failed {
            retry_scheduled: true,
            ..
        }
    ));
    let state = h.controller.attempt_state();
    assert_eq!(h.controller.phase(), CompletionPhase::Error);
    assert_eq!(state.attempts_count, 1);
    assert!(!state.is_processing);
    assert!(state.last_error.is_some());

    sleep(Duration::from_secs(3)).await;
    assert_eq!(writer.calls(), 2);
    assert_eq!(h.controller.phase(), CompletionPhase::Error);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(writer.calls(), 3);

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.phase, CompletionPhase::Completed);
    assert_eq!(snapshot.attempt.attempts_count, 3);
    assert_eq!(snapshot.attempt.last_error, None);
    assert!(!snapshot.attempt.can_manual_override);
    assert!(snapshot.completed_at.is_some());

    let metrics = h.metrics.lock().unwrap().clone();
    assert_eq!(metrics.writes_attempted, 3);
    assert_eq!(metrics.writes_failed, 2);
    assert_eq!(metrics.writes_succeeded, 1);
    assert_eq!(metrics.retries_scheduled, 2);
    assert_eq!(writer.written.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_wait_for_the_backoff() {
    let writer = ScriptedWriter::failing(1);
    let h = harness(writer.clone());

    h.controller.on_completion_intent().await;
    sleep(Duration::from_millis(1_900)).await;
    assert_eq!(writer.calls(), 1);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(writer.calls(), 2);
    assert!(h.controller.is_completed());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_unlock_manual_override() {
    let writer = ScriptedWriter::failing(3);
    let h = harness(writer.clone());
    h.controller.update_watch_percentage(97.0);

    h.controller.on_completion_intent().await;
    sleep(Duration::from_secs(3)).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(writer.calls(), 3);

    let state = h.controller.attempt_state();
    assert_eq!(h.controller.phase(), CompletionPhase::Error);
    assert_eq!(state.attempts_count, 3);
    assert!(state.can_manual_override);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(writer.calls(), 3, "no automatic retry after the budget is spent");
    assert_eq!(
        h.controller.on_completion_intent().await,
        CompletionOutcome::Exhausted
    );

    let outcome = h.controller.force_complete().await;
    assert!(outcome.is_completed());
    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.phase, CompletionPhase::Completed);
    assert_eq!(snapshot.attempt.attempts_count, 4);
    assert!(!snapshot.attempt.can_manual_override);

    let written = writer.written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].source, CompletionReason::Manual);
    assert!(written[0].completed);
}

#[tokio::test(start_paused = true)]
async fn manual_override_requires_threshold() {
    let writer = ScriptedWriter::failing(5);
    let h = harness_with(
        writer.clone(),
        CircuitBreakerRegistry::default(),
        PersistencePolicy {
            max_attempts: 1,
            ..PersistencePolicy::default()
        },
    );
    h.controller.update_watch_percentage(80.0);
    assert_eq!(
        h.controller.force_complete().await,
        CompletionOutcome::OverrideUnavailable
    );

    h.controller.on_completion_intent().await;
    assert!(!h.controller.attempt_state().can_manual_override);
    assert_eq!(
        h.controller.force_complete().await,
        CompletionOutcome::OverrideUnavailable
    );

    h.controller.update_watch_percentage(95.0);
    assert!(h.controller.attempt_state().can_manual_override);
    let outcome = h.controller.force_complete().await;
    assert!(matches!(
        outcome,
        CompletionOutcome::Failed {
            retry_scheduled: false,
            ..
        }
    ));
    assert_eq!(writer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn only_one_write_in_flight() {
    let writer = ScriptedWriter::gated();
    let h = harness(writer.clone());
    h.controller.update_watch_percentage(99.0);

    let first = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.on_completion_intent().await })
    };
    wait_for_calls(&writer, 1).await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.phase, CompletionPhase::Saving);
    assert!(snapshot.attempt.is_processing);
    assert!(!snapshot.attempt.can_manual_override);

    assert_eq!(
        h.controller.on_completion_intent().await,
        CompletionOutcome::Dropped
    );
    assert_eq!(h.controller.force_complete().await, CompletionOutcome::Dropped);

    writer.release();
    assert!(first.await.unwrap().is_completed());
    assert_eq!(writer.calls(), 1);
    assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.lock().unwrap().intents_dropped, 2);
    assert_eq!(
        h.controller.on_completion_intent().await,
        CompletionOutcome::AlreadyCompleted
    );
}

#[tokio::test(start_paused = true)]
async fn open_breaker_skips_write_without_retry() {
    let writer = ScriptedWriter::failing(1);
    let h = harness_with(
        writer.clone(),
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }),
        PersistencePolicy::default(),
    );
    h.controller.update_watch_percentage(97.0);

    let outcome = h.controller.on_completion_intent().await;
    assert!(matches!(
        outcome,
        CompletionOutcome::Failed {
            retry_scheduled: false,
            ..
        }
    ));
    assert_eq!(
        h.breakers.snapshot(COMPLETION_WRITE_OPERATION).state,
        CircuitState::Open
    );

    assert_eq!(h.controller.force_complete().await, CompletionOutcome::Skipped);
    let state = h.controller.attempt_state();
    assert_eq!(h.controller.phase(), CompletionPhase::Error);
    assert_eq!(state.attempts_count, 1);
    assert_eq!(state.last_error.as_deref(), Some(SAVE_FAILED_MESSAGE));
    assert!(state.can_manual_override);
    assert_eq!(writer.calls(), 1);
    assert_eq!(h.metrics.lock().unwrap().writes_rejected, 1);

    sleep(Duration::from_secs(61)).await;
    assert!(h.controller.force_complete().await.is_completed());
    assert_eq!(writer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_write_times_out_as_failure() {
    let writer = ScriptedWriter::hanging();
    let h = harness_with(
        writer.clone(),
        CircuitBreakerRegistry::default(),
        PersistencePolicy {
            max_attempts: 1,
            saving_timeout: Duration::from_secs(15),
            ..PersistencePolicy::default()
        },
    );
    h.controller.update_watch_percentage(100.0);

    match h.controller.on_completion_intent().await {
        CompletionOutcome::Failed {
            error,
            retry_scheduled,
        } => {
            assert!(error.contains("timed out"), "unexpected error: {error}");
            assert!(!retry_scheduled);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    let state = h.controller.attempt_state();
    assert!(!state.is_processing);
    assert!(state.can_manual_override);
}

#[tokio::test(start_paused = true)]
async fn close_discards_late_results_and_pending_retries() {
    let writer = ScriptedWriter::gated();
    let h = harness(writer.clone());

    let pending = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.on_completion_intent().await })
    };
    wait_for_calls(&writer, 1).await;
    h.controller.close();
    writer.release();

    assert_eq!(pending.await.unwrap(), CompletionOutcome::Cancelled);
    assert_eq!(h.controller.phase(), CompletionPhase::Saving);
    assert!(h.controller.is_closed());
    assert_eq!(
        h.controller.on_completion_intent().await,
        CompletionOutcome::Cancelled
    );

    let failing = ScriptedWriter::failing(1);
    let h = harness(failing.clone());
    h.controller.on_completion_intent().await;
    h.controller.close();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(failing.calls(), 1);
    assert_eq!(h.controller.phase(), CompletionPhase::Error);
}

#[tokio::test(start_paused = true)]
async fn anonymous_learner_never_writes() {
    let writer = ScriptedWriter::failing(0);
    let metrics = Arc::new(Mutex::new(PerformanceData::default()));
    let controller = CompletionController::new(
        None,
        &UnitRef::new("unit-1", "course-1"),
        writer.clone(),
        Arc::new(CircuitBreakerRegistry::default()),
        PersistencePolicy::default(),
        metrics,
    );
    controller.update_watch_percentage(100.0);

    assert_eq!(
        controller.on_completion_intent().await,
        CompletionOutcome::Unauthenticated
    );
    assert_eq!(
        controller.attempt_completion(CompletionReason::Manual).await,
        CompletionOutcome::Unauthenticated
    );
    assert_eq!(writer.calls(), 0);
    assert_eq!(controller.phase(), CompletionPhase::Idle);
}
