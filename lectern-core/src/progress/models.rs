use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRef {
    pub unit_id: String,
    pub course_id: String,
}

impl UnitRef {
    pub fn new(unit_id: impl Into<String>, course_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            course_id: course_id.into(),
        }
    }
}

/// Per (user, unit) watch aggregate for one playback session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoProgressState {
    pub unit_id: String,
    pub course_id: String,
    pub watched_duration_seconds: f64,
    pub total_duration_seconds: f64,
    pub watch_percentage: f64,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VideoProgressState {
    pub fn new(unit: &UnitRef) -> Self {
        Self {
            unit_id: unit.unit_id.clone(),
            course_id: unit.course_id.clone(),
            watched_duration_seconds: 0.0,
            total_duration_seconds: 0.0,
            watch_percentage: 0.0,
            is_completed: false,
            completed_at: None,
        }
    }

    /// Whole-number percentage for progress bars.
    pub fn display_percentage(&self) -> u8 {
        self.watch_percentage.round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub state: VideoProgressState,
    /// True for exactly the one sample that satisfied the completion policy.
    pub completion_intent: bool,
}
