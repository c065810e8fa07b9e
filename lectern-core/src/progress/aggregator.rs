use chrono::{DateTime, Utc};

use crate::config::CompletionSection;
use crate::playback::{SampleEventType, WatchSample};

use super::models::{ProgressUpdate, UnitRef, VideoProgressState};

const DURATION_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionPolicy {
    pub threshold_percent: f64,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            threshold_percent: 95.0,
        }
    }
}

impl From<&CompletionSection> for CompletionPolicy {
    fn from(section: &CompletionSection) -> Self {
        Self {
            threshold_percent: section.threshold_percent,
        }
    }
}

/// Turns the sample stream of one session into watch progress using
/// furthest-position semantics, so seeking back never lowers the percentage.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    policy: CompletionPolicy,
    state: VideoProgressState,
    max_time_reached: f64,
    has_previous_sample: bool,
    intent_emitted: bool,
}

impl ProgressAggregator {
    pub fn new(unit: &UnitRef, policy: CompletionPolicy) -> Self {
        Self {
            policy,
            state: VideoProgressState::new(unit),
            max_time_reached: 0.0,
            has_previous_sample: false,
            intent_emitted: false,
        }
    }

    pub fn state(&self) -> &VideoProgressState {
        &self.state
    }

    pub fn max_time_reached(&self) -> f64 {
        self.max_time_reached
    }

    pub fn intent_emitted(&self) -> bool {
        self.intent_emitted
    }

    pub fn update(&mut self, sample: &WatchSample) -> ProgressUpdate {
        if let Some(duration) = valid_duration(sample.duration_seconds) {
            self.state.total_duration_seconds = duration;
        }

        let ended = sample.source_event_type == SampleEventType::Ended;
        let position = if ended {
            sanitize_time(sample.current_time_seconds)
                .unwrap_or(0.0)
                .max(self.state.total_duration_seconds)
        } else {
            sanitize_time(sample.current_time_seconds).unwrap_or(self.max_time_reached)
        };

        let previous_max = self.max_time_reached;
        if position > previous_max {
            let counts_as_watched =
                self.has_previous_sample && sample.source_event_type != SampleEventType::Seek;
            if counts_as_watched {
                self.state.watched_duration_seconds += position - previous_max;
            }
            self.max_time_reached = position;
        }
        self.has_previous_sample = true;

        let total = self.state.total_duration_seconds;
        if total > 0.0 && self.state.watched_duration_seconds > total {
            self.state.watched_duration_seconds = total;
        }

        let computed = if ended {
            100.0
        } else if total > 0.0 {
            (100.0 * self.max_time_reached / total.max(DURATION_EPSILON)).clamp(0.0, 100.0)
        } else {
            0.0
        };
        if computed.is_finite() && computed > self.state.watch_percentage {
            self.state.watch_percentage = computed;
        }

        let completion_intent = !self.intent_emitted
            && (ended || self.state.watch_percentage >= self.policy.threshold_percent);
        if completion_intent {
            self.intent_emitted = true;
        }

        ProgressUpdate {
            state: self.state.clone(),
            completion_intent,
        }
    }

    /// Records a successful durable completion.
    pub fn mark_completed(&mut self, at: DateTime<Utc>) {
        self.state.is_completed = true;
        self.state.completed_at = Some(at);
    }

    /// Starts a fresh session for `unit`.
    pub fn reset(&mut self, unit: &UnitRef) {
        *self = Self::new(unit, self.policy);
    }
}

fn valid_duration(value: f64) -> Option<f64> {
    (value.is_finite() && value > DURATION_EPSILON).then_some(value)
}

fn sanitize_time(value: f64) -> Option<f64> {
    value.is_finite().then(|| value.max(0.0))
}
