use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::completion::{
    CompletionController, CompletionKey, CompletionOutcome, CompletionRecord, CompletionResult,
    CompletionSnapshot, CompletionWriter, PersistencePolicy, ProgressRecord,
    SqliteCompletionStore, UserIdentity,
};
use crate::config::{LecternConfig, PlaybackSection};
use crate::metrics::PerformanceData;
use crate::playback::{PlaybackEventSource, PlayerBackend, WatchSample};
use crate::progress::{
    CompletionPolicy, ProgressAggregator, ProgressUpdate, UnitRef, VideoProgressState,
};
use crate::resilience::{
    BreakerOutcome, CircuitBreakerConfig, CircuitBreakerRegistry, InstanceRegistry,
    PROGRESS_WRITE_OPERATION,
};
use crate::sync::lock;

/// Process-wide pieces shared by every session: the breaker registry, the
/// player instance registry and the durable writer.
pub struct ProgressRuntime {
    config: LecternConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    instances: Arc<InstanceRegistry>,
    writer: Arc<dyn CompletionWriter>,
}

impl fmt::Debug for ProgressRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressRuntime")
            .field("config", &self.config)
            .field("breakers", &self.breakers)
            .field("active_instances", &self.instances.active_instance_count())
            .finish()
    }
}

impl ProgressRuntime {
    pub fn new(config: LecternConfig, writer: Arc<dyn CompletionWriter>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
            &config.breaker,
        )));
        let instances = Arc::new(InstanceRegistry::new(config.playback.max_active_instances));
        Self {
            config,
            breakers,
            instances,
            writer,
        }
    }

    /// Opens (and initializes) the SQLite store named by `storage.database`,
    /// resolved against `base_dir`.
    pub fn with_sqlite_store(
        config: LecternConfig,
        base_dir: impl AsRef<Path>,
    ) -> CompletionResult<Self> {
        let path = config.resolve_path(base_dir, &config.storage.database);
        let store = SqliteCompletionStore::new(path)?;
        store.initialize()?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn config(&self) -> &LecternConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn instances(&self) -> &Arc<InstanceRegistry> {
        &self.instances
    }

    pub fn writer(&self) -> &Arc<dyn CompletionWriter> {
        &self.writer
    }

    /// Starts a watch session for `unit`. A missing `user` yields a session
    /// that tracks progress but never writes.
    pub async fn open_session(&self, user: Option<UserIdentity>, unit: UnitRef) -> VideoSession {
        let metrics = Arc::new(Mutex::new(PerformanceData::default()));
        let controller = CompletionController::new(
            user.as_ref(),
            &unit,
            Arc::clone(&self.writer),
            Arc::clone(&self.breakers),
            PersistencePolicy::from_config(&self.config),
            Arc::clone(&metrics),
        );
        let prior_completion = match controller.key() {
            Some(key) => self.load_prior_completion(key).await,
            None => None,
        };
        debug!(
            target: "session",
            unit_id = %unit.unit_id,
            course_id = %unit.course_id,
            authenticated = user.is_some(),
            previously_completed = prior_completion.is_some(),
            "video session opened"
        );

        let inner = Arc::new(SessionInner {
            aggregator: Mutex::new(ProgressAggregator::new(
                &unit,
                CompletionPolicy::from(&self.config.completion),
            )),
            user,
            unit,
            controller,
            writer: Arc::clone(&self.writer),
            breakers: Arc::clone(&self.breakers),
            instances: Arc::clone(&self.instances),
            playback: self.config.playback.clone(),
            progress_save_interval: self.config.persistence.progress_save_interval(),
            progress_save: Mutex::new(ProgressSaveState::default()),
            prior_completion,
            metrics,
            source: Mutex::new(None),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        VideoSession { inner }
    }

    /// Destroys every live player. Returns how many were torn down.
    pub async fn shutdown(&self) -> usize {
        let released = self.instances.teardown_all().await;
        info!(target: "session", released, "progress runtime shut down");
        released
    }

    async fn load_prior_completion(&self, key: &CompletionKey) -> Option<CompletionRecord> {
        let bound = self.config.persistence.saving_timeout();
        match timeout(bound, self.writer.load_completion(key)).await {
            Ok(Ok(record)) => record.filter(|record| record.completed),
            Ok(Err(err)) => {
                warn!(target: "session", %key, "failed to load prior completion: {err}");
                None
            }
            Err(_) => {
                warn!(target: "session", %key, "prior completion lookup timed out");
                None
            }
        }
    }
}

/// Everything the host UI renders for one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub video_progress: VideoProgressState,
    pub completion_state: CompletionSnapshot,
    pub is_video_completed: bool,
    pub display_percentage: u8,
    pub can_manual_override: bool,
    pub performance_data: PerformanceData,
}

#[derive(Debug, Default)]
struct ProgressSaveState {
    last_saved_at: Option<Instant>,
    dirty: bool,
}

struct SessionInner {
    user: Option<UserIdentity>,
    unit: UnitRef,
    aggregator: Mutex<ProgressAggregator>,
    controller: CompletionController,
    writer: Arc<dyn CompletionWriter>,
    breakers: Arc<CircuitBreakerRegistry>,
    instances: Arc<InstanceRegistry>,
    playback: PlaybackSection,
    progress_save_interval: Duration,
    progress_save: Mutex<ProgressSaveState>,
    prior_completion: Option<CompletionRecord>,
    metrics: Arc<Mutex<PerformanceData>>,
    source: Mutex<Option<Arc<PlaybackEventSource>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// One (user, unit, course) watch session: playback samples in, progress
/// and completion status out.
pub struct VideoSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for VideoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoSession")
            .field("unit", &self.inner.unit)
            .field("user", &self.inner.user)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl VideoSession {
    pub fn unit(&self) -> &UnitRef {
        &self.inner.unit
    }

    pub fn controller(&self) -> &CompletionController {
        &self.inner.controller
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> Option<Arc<PlaybackEventSource>> {
        lock(&self.inner.source).clone()
    }

    /// Feeds one sample through the aggregator and, when it crosses the
    /// completion threshold, into the completion controller.
    pub async fn ingest(&self, sample: WatchSample) -> ProgressUpdate {
        self.inner.ingest(sample).await
    }

    pub async fn force_complete(&self) -> CompletionOutcome {
        self.inner.force_complete().await
    }

    /// Mounts a player for this session and pumps its samples into
    /// [`VideoSession::ingest`]. A previously attached player is torn down.
    pub async fn attach_player(
        &self,
        backend: Arc<dyn PlayerBackend>,
        container_id: impl Into<String>,
    ) -> Arc<PlaybackEventSource> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = PlaybackEventSource::mount(
            backend,
            container_id,
            &self.inner.instances,
            &self.inner.playback,
            tx,
        )
        .await;

        let previous = lock(&self.inner.source).replace(Arc::clone(&source));
        if let Some(previous) = previous {
            previous.teardown().await;
        }

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.ingest(sample).await;
            }
        });
        if let Some(previous) = lock(&self.inner.pump).replace(pump) {
            previous.abort();
        }
        source
    }

    pub fn snapshot(&self) -> SessionView {
        self.inner.snapshot()
    }

    /// Stops the sample pump and pending retries, tears down the player and
    /// flushes unsaved progress. Later write results are ignored.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
        self.inner.controller.close();
        let source = lock(&self.inner.source).take();
        if let Some(source) = source {
            source.teardown().await;
        }
        self.inner.save_progress(true).await;
        debug!(
            target: "session",
            unit_id = %self.inner.unit.unit_id,
            course_id = %self.inner.unit.course_id,
            "video session closed"
        );
    }
}

impl SessionInner {
    async fn ingest(&self, sample: WatchSample) -> ProgressUpdate {
        if self.closed.load(Ordering::SeqCst) {
            return ProgressUpdate {
                state: lock(&self.aggregator).state().clone(),
                completion_intent: false,
            };
        }
        lock(&self.metrics).record_sample();
        let mut update = lock(&self.aggregator).update(&sample);
        lock(&self.progress_save).dirty = true;
        self.controller
            .update_watch_percentage(update.state.watch_percentage);

        let mut force_save = false;
        if update.completion_intent {
            info!(
                target: "session",
                unit_id = %self.unit.unit_id,
                course_id = %self.unit.course_id,
                percentage = update.state.watch_percentage,
                "completion threshold reached"
            );
            self.controller.on_completion_intent().await;
            force_save = true;
        }
        if self.sync_completion() {
            force_save = true;
        }
        update.state = lock(&self.aggregator).state().clone();
        self.save_progress(force_save).await;
        update
    }

    /// Copies a durable completion recorded by the controller, including one
    /// landed by a background retry, into the aggregator. Returns true when
    /// the aggregator was not marked yet.
    fn sync_completion(&self) -> bool {
        let Some(completed_at) = self.controller.snapshot().completed_at else {
            return false;
        };
        {
            let mut aggregator = lock(&self.aggregator);
            if aggregator.state().is_completed {
                return false;
            }
            aggregator.mark_completed(completed_at);
        }
        lock(&self.progress_save).dirty = true;
        true
    }

    async fn force_complete(&self) -> CompletionOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return CompletionOutcome::Cancelled;
        }
        let outcome = self.controller.force_complete().await;
        if self.sync_completion() {
            self.save_progress(true).await;
        }
        outcome
    }

    /// Mirrors progress to the store at most once per save interval unless
    /// `force` is set.
    async fn save_progress(&self, force: bool) {
        let Some(user) = self.user.as_ref() else {
            return;
        };
        let force = self.sync_completion() || force;
        {
            let save = lock(&self.progress_save);
            if !save.dirty {
                return;
            }
            let due = save
                .last_saved_at
                .map_or(true, |at| at.elapsed() >= self.progress_save_interval);
            if !force && !due {
                return;
            }
        }
        let record = ProgressRecord::from_state(user, lock(&self.aggregator).state());
        let writer = Arc::clone(&self.writer);
        let outcome = self
            .breakers
            .execute(PROGRESS_WRITE_OPERATION, || async move {
                writer.write_progress(&record).await
            })
            .await;

        let saved = matches!(outcome, BreakerOutcome::Completed(Ok(())));
        if saved {
            let mut save = lock(&self.progress_save);
            save.last_saved_at = Some(Instant::now());
            save.dirty = false;
        }
        lock(&self.metrics).record_progress_save(saved);
        match outcome {
            BreakerOutcome::Completed(Err(err)) => {
                warn!(target: "session", unit_id = %self.unit.unit_id, "progress save failed: {err}");
            }
            BreakerOutcome::Rejected => {
                debug!(target: "session", unit_id = %self.unit.unit_id, "progress save skipped, circuit open");
            }
            BreakerOutcome::Completed(Ok(())) => {}
        }
    }

    fn snapshot(&self) -> SessionView {
        let completion_state = self.controller.snapshot();
        let mut video_progress = lock(&self.aggregator).state().clone();
        if let Some(completed_at) = completion_state.completed_at {
            video_progress.is_completed = true;
            video_progress.completed_at = Some(completed_at);
        } else if let Some(prior) = &self.prior_completion {
            video_progress.is_completed = true;
            video_progress.completed_at.get_or_insert(prior.completed_at);
        }
        SessionView {
            is_video_completed: video_progress.is_completed,
            display_percentage: video_progress.display_percentage(),
            can_manual_override: completion_state.attempt.can_manual_override,
            performance_data: lock(&self.metrics).clone(),
            video_progress,
            completion_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionError, CompletionPhase, CompletionReason};
    use async_trait::async_trait;

    #[derive(Default)]
    struct MemoryWriter {
        completion_failures: Mutex<u32>,
        completions: Mutex<Vec<CompletionRecord>>,
        progress: Mutex<Vec<ProgressRecord>>,
        prior: Option<CompletionRecord>,
    }

    #[async_trait]
    impl CompletionWriter for MemoryWriter {
        async fn write_completion(&self, record: &CompletionRecord) -> CompletionResult<()> {
            {
                let mut failures = lock(&self.completion_failures);
                if *failures > 0 {
                    *failures -= 1;
                    return Err(CompletionError::Backend("connection reset".into()));
                }
            }
            lock(&self.completions).push(record.clone());
            Ok(())
        }

        async fn load_completion(
            &self,
            _key: &CompletionKey,
        ) -> CompletionResult<Option<CompletionRecord>> {
            Ok(self.prior.clone())
        }

        async fn write_progress(&self, record: &ProgressRecord) -> CompletionResult<()> {
            lock(&self.progress).push(record.clone());
            Ok(())
        }
    }

    fn unit() -> UnitRef {
        UnitRef::new("unit-7", "course-2")
    }

    #[tokio::test(start_paused = true)]
    async fn progress_saves_are_debounced() {
        let writer = Arc::new(MemoryWriter::default());
        let runtime = ProgressRuntime::new(LecternConfig::default(), writer.clone());
        let session = runtime
            .open_session(Some(UserIdentity::new("learner")), unit())
            .await;

        session.ingest(WatchSample::time_update(1.0, 600.0)).await;
        session.ingest(WatchSample::time_update(2.0, 600.0)).await;
        session.ingest(WatchSample::time_update(3.0, 600.0)).await;
        assert_eq!(lock(&writer.progress).len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        session.ingest(WatchSample::time_update(13.0, 600.0)).await;
        assert_eq!(lock(&writer.progress).len(), 2);

        session.ingest(WatchSample::time_update(14.0, 600.0)).await;
        session.close().await;
        let saved = lock(&writer.progress);
        assert_eq!(saved.len(), 3);
        assert!(saved.last().is_some_and(|record| (record.watch_percentage - 14.0 / 6.0).abs() < 1e-9));
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_session_tracks_progress_without_writing() {
        let writer = Arc::new(MemoryWriter::default());
        let runtime = ProgressRuntime::new(LecternConfig::default(), writer.clone());
        let session = runtime.open_session(None, unit()).await;

        let update = session.ingest(WatchSample::ended(60.0)).await;
        assert!(update.completion_intent);
        assert_eq!(session.force_complete().await, CompletionOutcome::Unauthenticated);

        let view = session.snapshot();
        assert_eq!(view.display_percentage, 100);
        assert!(!view.is_video_completed);
        assert_eq!(view.completion_state.phase, CompletionPhase::Idle);
        assert!(lock(&writer.completions).is_empty());
        assert!(lock(&writer.progress).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prior_completion_is_reflected_in_view() {
        let key = CompletionKey::new(&UserIdentity::new("learner"), &unit());
        let writer = Arc::new(MemoryWriter {
            prior: Some(CompletionRecord::completed_now(&key, CompletionReason::Auto)),
            ..MemoryWriter::default()
        });
        let runtime = ProgressRuntime::new(LecternConfig::default(), writer.clone());
        let session = runtime
            .open_session(Some(UserIdentity::new("learner")), unit())
            .await;

        let view = session.snapshot();
        assert!(view.is_video_completed);
        assert_eq!(view.completion_state.phase, CompletionPhase::Idle);

        session.ingest(WatchSample::ended(60.0)).await;
        assert_eq!(lock(&writer.completions).len(), 1);
        assert_eq!(session.snapshot().completion_state.phase, CompletionPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_completion_reaches_progress_state() {
        let writer = Arc::new(MemoryWriter {
            completion_failures: Mutex::new(1),
            ..MemoryWriter::default()
        });
        let runtime = ProgressRuntime::new(LecternConfig::default(), writer.clone());
        let session = runtime
            .open_session(Some(UserIdentity::new("learner")), unit())
            .await;

        let first = session.ingest(WatchSample::time_update(96.0, 100.0)).await;
        assert!(first.completion_intent);
        assert!(!first.state.is_completed);
        assert_eq!(session.snapshot().completion_state.phase, CompletionPhase::Error);
        let saves_before_retry = lock(&writer.progress).len();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(session.snapshot().completion_state.phase, CompletionPhase::Completed);
        assert_eq!(lock(&writer.completions).len(), 1);

        let next = session.ingest(WatchSample::time_update(97.0, 100.0)).await;
        let view = session.snapshot();
        assert!(next.state.is_completed);
        assert_eq!(next.state.completed_at, view.completion_state.completed_at);
        assert_eq!(view.video_progress, next.state);

        let saved = lock(&writer.progress);
        assert_eq!(saved.len(), saves_before_retry + 1);
        assert!(saved.last().is_some_and(|record| record.watch_percentage == 97.0));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_ignores_samples() {
        let writer = Arc::new(MemoryWriter::default());
        let runtime = ProgressRuntime::new(LecternConfig::default(), writer.clone());
        let session = runtime
            .open_session(Some(UserIdentity::new("learner")), unit())
            .await;
        session.close().await;

        let update = session.ingest(WatchSample::ended(60.0)).await;
        assert!(!update.completion_intent);
        assert_eq!(session.force_complete().await, CompletionOutcome::Cancelled);
        assert!(lock(&writer.completions).is_empty());
        assert_eq!(session.snapshot().performance_data.samples_processed, 0);
    }
}
