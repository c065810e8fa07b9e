use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::progress::{UnitRef, VideoProgressState};

/// Authenticated identity supplied by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Unique key of one durable completion row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionKey {
    pub user_id: String,
    pub unit_id: String,
    pub course_id: String,
}

impl CompletionKey {
    pub fn new(user: &UserIdentity, unit: &UnitRef) -> Self {
        Self {
            user_id: user.user_id.clone(),
            unit_id: unit.unit_id.clone(),
            course_id: unit.course_id.clone(),
        }
    }
}

impl fmt::Display for CompletionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.unit_id, self.course_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Auto,
    Manual,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Auto => "auto",
            CompletionReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CompletionReason::Auto),
            "manual" => Ok(CompletionReason::Manual),
            other => Err(format!("unknown completion source: {other}")),
        }
    }
}

/// The upserted completion row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub user_id: String,
    pub unit_id: String,
    pub course_id: String,
    pub completed: bool,
    pub completed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source: CompletionReason,
}

impl CompletionRecord {
    pub fn completed_now(key: &CompletionKey, source: CompletionReason) -> Self {
        let now = Utc::now();
        Self {
            user_id: key.user_id.clone(),
            unit_id: key.unit_id.clone(),
            course_id: key.course_id.clone(),
            completed: true,
            completed_at: now,
            updated_at: now,
            source,
        }
    }

    pub fn key(&self) -> CompletionKey {
        CompletionKey {
            user_id: self.user_id.clone(),
            unit_id: self.unit_id.clone(),
            course_id: self.course_id.clone(),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let completed_at: NaiveDateTime = row.get("completed_at")?;
        let updated_at: NaiveDateTime = row.get("updated_at")?;
        Ok(Self {
            user_id: row.get("user_id")?,
            unit_id: row.get("unit_id")?,
            course_id: row.get("course_id")?,
            completed: row.get::<_, i64>("completed")? != 0,
            completed_at: Utc.from_utc_datetime(&completed_at),
            updated_at: Utc.from_utc_datetime(&updated_at),
            source: parse_source(row)?,
        })
    }
}

fn parse_source(row: &Row<'_>) -> rusqlite::Result<CompletionReason> {
    let raw: String = row.get("source")?;
    raw.parse().map_err(|err: String| {
        let index = row.as_ref().column_index("source").unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.into())
    })
}

/// Mirror of [`VideoProgressState`] in the `video_progress` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub user_id: String,
    pub unit_id: String,
    pub course_id: String,
    pub watched_duration_seconds: f64,
    pub total_duration_seconds: f64,
    pub watch_percentage: f64,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn from_state(user: &UserIdentity, state: &VideoProgressState) -> Self {
        Self {
            user_id: user.user_id.clone(),
            unit_id: state.unit_id.clone(),
            course_id: state.course_id.clone(),
            watched_duration_seconds: state.watched_duration_seconds,
            total_duration_seconds: state.total_duration_seconds,
            watch_percentage: state.watch_percentage,
            updated_at: Utc::now(),
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let updated_at: NaiveDateTime = row.get("updated_at")?;
        Ok(Self {
            user_id: row.get("user_id")?,
            unit_id: row.get("unit_id")?,
            course_id: row.get("course_id")?,
            watched_duration_seconds: row.get("watched_duration_s")?,
            total_duration_seconds: row.get("total_duration_s")?,
            watch_percentage: row.get("watch_percentage")?,
            updated_at: Utc.from_utc_datetime(&updated_at),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseCompletionSummary {
    pub course_id: String,
    pub completed_units: usize,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPhase {
    Idle,
    Saving,
    Error,
    Completed,
}

impl CompletionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionPhase::Idle => "idle",
            CompletionPhase::Saving => "saving",
            CompletionPhase::Error => "error",
            CompletionPhase::Completed => "completed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, CompletionPhase::Completed)
    }
}

impl fmt::Display for CompletionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the durable completion write, rendered by the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAttemptState {
    pub attempts_count: u32,
    pub last_error: Option<String>,
    pub is_processing: bool,
    pub can_manual_override: bool,
}

impl Default for CompletionAttemptState {
    fn default() -> Self {
        Self {
            attempts_count: 0,
            last_error: None,
            is_processing: false,
            can_manual_override: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSnapshot {
    pub phase: CompletionPhase,
    #[serde(flatten)]
    pub attempt: CompletionAttemptState,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a call to `attempt_completion` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed { completed_at: DateTime<Utc> },
    AlreadyCompleted,
    /// The write failed; `retry_scheduled` tells whether a timer will retry.
    Failed { error: String, retry_scheduled: bool },
    /// The circuit breaker refused the write.
    Skipped,
    /// Another write for this session is still in flight.
    Dropped,
    /// No retry budget left for automatic completion.
    Exhausted,
    /// Manual override requested before it was available.
    OverrideUnavailable,
    /// No authenticated user; nothing is written.
    Unauthenticated,
    /// The session was closed before the result arrived.
    Cancelled,
}

impl CompletionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            CompletionOutcome::Completed { .. } | CompletionOutcome::AlreadyCompleted
        )
    }
}
