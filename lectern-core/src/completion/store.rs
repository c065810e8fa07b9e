use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::open_configured;

use super::models::{
    CompletionKey, CompletionRecord, CourseCompletionSummary, ProgressRecord,
};
use super::{CompletionError, CompletionResult};

const COMPLETION_SCHEMA: &str = include_str!("../../../sql/completions.sql");

/// Durable side of the pipeline. Implementations must make
/// `write_completion` an idempotent upsert on [`CompletionKey`].
#[async_trait]
pub trait CompletionWriter: Send + Sync {
    async fn write_completion(&self, record: &CompletionRecord) -> CompletionResult<()>;
    async fn load_completion(&self, key: &CompletionKey)
        -> CompletionResult<Option<CompletionRecord>>;
    async fn write_progress(&self, record: &ProgressRecord) -> CompletionResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteCompletionStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteCompletionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteCompletionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> CompletionResult<SqliteCompletionStore> {
        let path = self.path.ok_or(CompletionError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteCompletionStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteCompletionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCompletionStore {
    pub fn builder() -> SqliteCompletionStoreBuilder {
        SqliteCompletionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> CompletionResult<Self> {
        SqliteCompletionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> CompletionResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| CompletionError::OpenDatabase {
            path: self.path.clone(),
            source,
        })
    }

    pub fn initialize(&self) -> CompletionResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    CompletionError::Backend(format!(
                        "failed to create {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = self.open()?;
        conn.execute_batch(COMPLETION_SCHEMA)?;
        Ok(())
    }

    /// Inserts or refreshes the completion row; the latest write wins on
    /// `completed_at` and `updated_at`.
    pub fn upsert_completion(&self, record: &CompletionRecord) -> CompletionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO unit_completions (
                user_id, unit_id, course_id, completed, completed_at, updated_at, source
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id, unit_id, course_id) DO UPDATE SET
                completed = excluded.completed,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at,
                source = excluded.source",
            params![
                &record.user_id,
                &record.unit_id,
                &record.course_id,
                if record.completed { 1 } else { 0 },
                record.completed_at.naive_utc(),
                record.updated_at.naive_utc(),
                record.source.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn fetch_completion(&self, key: &CompletionKey) -> CompletionResult<Option<CompletionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM unit_completions
             WHERE user_id = ?1 AND unit_id = ?2 AND course_id = ?3",
        )?;
        let record = stmt
            .query_row(
                params![&key.user_id, &key.unit_id, &key.course_id],
                |row| CompletionRecord::from_row(row),
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_completions(
        &self,
        user_id: Option<&str>,
        course_id: Option<&str>,
        limit: usize,
    ) -> CompletionResult<Vec<CompletionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM unit_completions
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR course_id = ?2)
             ORDER BY completed_at DESC, unit_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id, course_id, limit as i64], |row| {
                CompletionRecord::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_completions(&self) -> CompletionResult<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM unit_completions WHERE completed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn course_summary(&self, user_id: &str) -> CompletionResult<Vec<CourseCompletionSummary>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT course_id, COUNT(*), MAX(completed_at)
             FROM unit_completions
             WHERE user_id = ?1 AND completed = 1
             GROUP BY course_id
             ORDER BY course_id",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                let last: Option<NaiveDateTime> = row.get(2)?;
                Ok(CourseCompletionSummary {
                    course_id: row.get(0)?,
                    completed_units: row.get::<_, i64>(1)? as usize,
                    last_completed_at: last.map(|dt| Utc.from_utc_datetime(&dt)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clears a completion, e.g. when an operator revokes it.
    pub fn delete_completion(&self, key: &CompletionKey) -> CompletionResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM unit_completions
             WHERE user_id = ?1 AND unit_id = ?2 AND course_id = ?3",
            params![&key.user_id, &key.unit_id, &key.course_id],
        )?;
        if affected == 0 {
            return Err(CompletionError::NotFound {
                user_id: key.user_id.clone(),
                unit_id: key.unit_id.clone(),
                course_id: key.course_id.clone(),
            });
        }
        Ok(())
    }

    /// Upserts the progress mirror; the stored percentage never decreases.
    pub fn upsert_progress(&self, record: &ProgressRecord) -> CompletionResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO video_progress (
                user_id, unit_id, course_id, watched_duration_s, total_duration_s,
                watch_percentage, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(user_id, unit_id, course_id) DO UPDATE SET
                watched_duration_s = MAX(video_progress.watched_duration_s, excluded.watched_duration_s),
                total_duration_s = CASE
                    WHEN excluded.total_duration_s > 0 THEN excluded.total_duration_s
                    ELSE video_progress.total_duration_s
                END,
                watch_percentage = MAX(video_progress.watch_percentage, excluded.watch_percentage),
                updated_at = excluded.updated_at",
            params![
                &record.user_id,
                &record.unit_id,
                &record.course_id,
                record.watched_duration_seconds,
                record.total_duration_seconds,
                record.watch_percentage,
                record.updated_at.naive_utc(),
            ],
        )?;
        Ok(())
    }

    pub fn fetch_progress(
        &self,
        user_id: &str,
        unit_id: &str,
    ) -> CompletionResult<Vec<ProgressRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM video_progress
             WHERE user_id = ?1 AND unit_id = ?2
             ORDER BY course_id",
        )?;
        let rows = stmt
            .query_map([user_id, unit_id], |row| ProgressRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl CompletionWriter for SqliteCompletionStore {
    async fn write_completion(&self, record: &CompletionRecord) -> CompletionResult<()> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.upsert_completion(&record)).await?
    }

    async fn load_completion(
        &self,
        key: &CompletionKey,
    ) -> CompletionResult<Option<CompletionRecord>> {
        let store = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.fetch_completion(&key)).await?
    }

    async fn write_progress(&self, record: &ProgressRecord) -> CompletionResult<()> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.upsert_progress(&record)).await?
    }
}
