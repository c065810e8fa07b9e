use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::PlaybackResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEventType {
    TimeUpdate,
    Seek,
    Ended,
    Poll,
}

impl SampleEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleEventType::TimeUpdate => "timeupdate",
            SampleEventType::Seek => "seek",
            SampleEventType::Ended => "ended",
            SampleEventType::Poll => "poll",
        }
    }
}

impl fmt::Display for SampleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized playback tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchSample {
    pub current_time_seconds: f64,
    pub duration_seconds: f64,
    pub source_event_type: SampleEventType,
}

impl WatchSample {
    pub fn new(current: f64, duration: f64, source_event_type: SampleEventType) -> Self {
        Self {
            current_time_seconds: current,
            duration_seconds: duration,
            source_event_type,
        }
    }

    pub fn time_update(current: f64, duration: f64) -> Self {
        Self::new(current, duration, SampleEventType::TimeUpdate)
    }

    pub fn seek(current: f64, duration: f64) -> Self {
        Self::new(current, duration, SampleEventType::Seek)
    }

    pub fn ended(duration: f64) -> Self {
        Self::new(duration, duration, SampleEventType::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerKind {
    /// Third-party player embedded from a video-sharing provider.
    Embedded,
    /// Uploaded file played through a native media element.
    Uploaded,
}

impl PlayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerKind::Embedded => "embedded",
            PlayerKind::Uploaded => "uploaded",
        }
    }

    /// Embedded providers do not fire `timeupdate`/`ended` reliably.
    pub fn needs_polling(&self) -> bool {
        matches!(self, PlayerKind::Embedded)
    }
}

impl fmt::Display for PlayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlayerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(PlayerKind::Embedded),
            "uploaded" => Ok(PlayerKind::Uploaded),
            other => Err(format!("unknown player kind: {other}")),
        }
    }
}

/// Raw events pushed by the host player integration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    Ready,
    Play,
    Pause,
    TimeUpdate { current: f64, duration: f64 },
    Seeked { current: f64, duration: f64 },
    Ended { duration: f64 },
}

/// The playback capability shared by both player variants.
#[async_trait]
pub trait PlayerBackend: Send + Sync {
    fn kind(&self) -> PlayerKind;
    /// Resolves once the player can report time and duration.
    async fn wait_ready(&self) -> PlaybackResult<()>;
    async fn play(&self) -> PlaybackResult<()>;
    async fn pause(&self) -> PlaybackResult<()>;
    async fn current_time(&self) -> PlaybackResult<f64>;
    async fn duration(&self) -> PlaybackResult<f64>;
    async fn destroy(&self) -> PlaybackResult<()>;
}
