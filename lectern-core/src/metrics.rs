use serde::{Deserialize, Serialize};

/// Counters describing how a session's pipeline behaved, shown next to the
/// progress bar in diagnostics views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    pub samples_processed: u64,
    pub completion_intents: u64,
    pub intents_dropped: u64,
    pub writes_attempted: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
    pub writes_rejected: u64,
    pub retries_scheduled: u64,
    pub progress_saves: u64,
    pub progress_save_failures: u64,
    pub last_write_latency_ms: Option<u64>,
}

impl PerformanceData {
    pub fn record_sample(&mut self) {
        self.samples_processed = self.samples_processed.saturating_add(1);
    }

    pub fn record_intent(&mut self) {
        self.completion_intents = self.completion_intents.saturating_add(1);
    }

    pub fn record_dropped_intent(&mut self) {
        self.intents_dropped = self.intents_dropped.saturating_add(1);
    }

    pub fn record_write(&mut self, success: bool, latency_ms: u64) {
        self.writes_attempted = self.writes_attempted.saturating_add(1);
        if success {
            self.writes_succeeded = self.writes_succeeded.saturating_add(1);
        } else {
            self.writes_failed = self.writes_failed.saturating_add(1);
        }
        self.last_write_latency_ms = Some(latency_ms);
    }

    pub fn record_rejected_write(&mut self) {
        self.writes_rejected = self.writes_rejected.saturating_add(1);
    }

    pub fn record_retry(&mut self) {
        self.retries_scheduled = self.retries_scheduled.saturating_add(1);
    }

    pub fn record_progress_save(&mut self, success: bool) {
        if success {
            self.progress_saves = self.progress_saves.saturating_add(1);
        } else {
            self.progress_save_failures = self.progress_save_failures.saturating_add(1);
        }
    }

    pub fn write_success_rate(&self) -> f64 {
        if self.writes_attempted == 0 {
            0.0
        } else {
            (self.writes_succeeded as f64 / self.writes_attempted as f64) * 100.0
        }
    }
}
