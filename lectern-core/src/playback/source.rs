use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PlaybackSection;
use crate::resilience::{InstanceRegistry, ManagedInstance};
use crate::sync::lock;

use super::types::{PlayerBackend, PlayerEvent, PlayerKind, SampleEventType, WatchSample};
use super::PlaybackResult;

/// Polled positions this close to the end count as `ended`.
const ENDED_TOLERANCE_SECONDS: f64 = 0.5;

pub type SampleSink = mpsc::UnboundedSender<WatchSample>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Initializing,
    Ready,
    /// The player never became ready; the source renders but emits nothing.
    Degraded,
    TornDown,
}

/// Normalizes native and embedded player events into one ordered sample
/// stream.
pub struct PlaybackEventSource {
    instance_id: String,
    container_id: String,
    backend: Arc<dyn PlayerBackend>,
    sink: SampleSink,
    registry: Weak<InstanceRegistry>,
    status: Mutex<SourceStatus>,
    torn_down: AtomicBool,
    ended_emitted: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PlaybackEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackEventSource")
            .field("instance_id", &self.instance_id)
            .field("container_id", &self.container_id)
            .field("kind", &self.backend.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl PlaybackEventSource {
    /// Registers the player, waits for it to become ready and starts the
    /// polling fallback when the player kind needs it. Never fails: an
    /// unresponsive player leaves the source in [`SourceStatus::Degraded`].
    pub async fn mount(
        backend: Arc<dyn PlayerBackend>,
        container_id: impl Into<String>,
        registry: &Arc<InstanceRegistry>,
        config: &PlaybackSection,
        sink: SampleSink,
    ) -> Arc<Self> {
        let source = Arc::new(Self {
            instance_id: format!("player-{}", Uuid::new_v4().simple()),
            container_id: container_id.into(),
            backend,
            sink,
            registry: Arc::downgrade(registry),
            status: Mutex::new(SourceStatus::Initializing),
            torn_down: AtomicBool::new(false),
            ended_emitted: AtomicBool::new(false),
            poll_task: Mutex::new(None),
        });

        registry.register(source.clone()).await;

        let init_timeout = config.init_timeout();
        match timeout(init_timeout, source.backend.wait_ready()).await {
            Ok(Ok(())) => {
                if source.is_torn_down() {
                    return source;
                }
                source.set_status(SourceStatus::Ready);
                info!(
                    target: "playback",
                    instance_id = %source.instance_id,
                    kind = %source.kind(),
                    "player ready"
                );
                if source.kind().needs_polling() {
                    source.start_polling(config.poll_interval());
                }
            }
            Ok(Err(err)) => {
                warn!(
                    target: "playback",
                    instance_id = %source.instance_id,
                    "player failed to initialize, degrading: {err}"
                );
                source.degrade();
            }
            Err(_) => {
                warn!(
                    target: "playback",
                    instance_id = %source.instance_id,
                    timeout = ?init_timeout,
                    "player not ready in time, degrading"
                );
                source.degrade();
            }
        }
        source
    }

    pub fn id(&self) -> &str {
        &self.instance_id
    }

    pub fn kind(&self) -> PlayerKind {
        self.backend.kind()
    }

    pub fn status(&self) -> SourceStatus {
        *lock(&self.status)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub async fn play(&self) -> PlaybackResult<()> {
        self.ensure_live()?;
        self.backend.play().await
    }

    pub async fn pause(&self) -> PlaybackResult<()> {
        self.ensure_live()?;
        self.backend.pause().await
    }

    /// Normalizes a host event and forwards the resulting sample, if any.
    pub fn dispatch(&self, event: PlayerEvent) -> Option<WatchSample> {
        if self.status() != SourceStatus::Ready {
            return None;
        }
        let sample = match event {
            PlayerEvent::Ready | PlayerEvent::Play | PlayerEvent::Pause => return None,
            PlayerEvent::TimeUpdate { current, duration } => {
                WatchSample::time_update(current, duration)
            }
            PlayerEvent::Seeked { current, duration } => WatchSample::seek(current, duration),
            PlayerEvent::Ended { duration } => {
                self.ended_emitted.store(true, Ordering::SeqCst);
                WatchSample::ended(duration)
            }
        };
        self.emit(sample).then_some(sample)
    }

    /// Accepts a JSON message posted by an embedded player bridge.
    pub fn dispatch_json(&self, payload: &str) -> PlaybackResult<Option<WatchSample>> {
        let event: PlayerEvent = serde_json::from_str(payload)?;
        Ok(self.dispatch(event))
    }

    /// Stops polling, destroys the player and leaves the registry. Safe to
    /// call any number of times.
    pub async fn teardown(&self) {
        if let Err(err) = self.shutdown().await {
            warn!(
                target: "playback",
                instance_id = %self.instance_id,
                "player teardown failed: {err}"
            );
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.instance_id);
        }
    }

    async fn shutdown(&self) -> PlaybackResult<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = lock(&self.poll_task).take() {
            handle.abort();
        }
        self.set_status(SourceStatus::TornDown);
        if let Err(err) = self.backend.pause().await {
            debug!(target: "playback", instance_id = %self.instance_id, "pause before destroy failed: {err}");
        }
        self.backend.destroy().await?;
        debug!(target: "playback", instance_id = %self.instance_id, "player destroyed");
        Ok(())
    }

    fn ensure_live(&self) -> PlaybackResult<()> {
        if self.is_torn_down() {
            Err(super::PlaybackError::TornDown)
        } else {
            Ok(())
        }
    }

    fn set_status(&self, status: SourceStatus) {
        *lock(&self.status) = status;
    }

    fn degrade(&self) {
        let mut status = lock(&self.status);
        if *status != SourceStatus::TornDown {
            *status = SourceStatus::Degraded;
        }
    }

    fn emit(&self, sample: WatchSample) -> bool {
        if self.is_torn_down() {
            return false;
        }
        self.sink.send(sample).is_ok()
    }

    fn start_polling(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_position: Option<f64> = None;
            loop {
                ticker.tick().await;
                let Some(source) = weak.upgrade() else {
                    break;
                };
                if source.is_torn_down() || !source.poll_once(&mut last_position).await {
                    break;
                }
            }
        });
        *lock(&self.poll_task) = Some(handle);
    }

    /// Returns false once samples can no longer be delivered.
    async fn poll_once(&self, last_position: &mut Option<f64>) -> bool {
        let current = match self.backend.current_time().await {
            Ok(value) => value,
            Err(err) => {
                debug!(target: "playback", instance_id = %self.instance_id, "poll failed: {err}");
                return true;
            }
        };
        let duration = self.backend.duration().await.unwrap_or(0.0);

        if last_position.map_or(true, |previous| previous != current) {
            *last_position = Some(current);
            if !self.emit(WatchSample::new(current, duration, SampleEventType::Poll)) {
                return false;
            }
        }

        let reached_end = duration.is_finite()
            && duration > 0.0
            && current >= duration - ENDED_TOLERANCE_SECONDS;
        if reached_end && !self.ended_emitted.swap(true, Ordering::SeqCst) {
            return self.emit(WatchSample::ended(duration));
        }
        true
    }
}

#[async_trait]
impl ManagedInstance for PlaybackEventSource {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn kind(&self) -> PlayerKind {
        self.backend.kind()
    }

    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn release(&self) -> PlaybackResult<()> {
        self.shutdown().await
    }
}
