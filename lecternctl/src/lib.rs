use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use lectern_core::{
    load_lectern_config, CompletionError, CompletionKey, CompletionReason, CompletionRecord,
    CourseCompletionSummary, LecternConfig, ProgressRecord, ProgressRuntime, SessionView,
    SqliteCompletionStore, UnitRef, UserIdentity, WatchSample,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] lectern_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] CompletionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid trace: {0}")]
    InvalidTrace(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Lectern watch-progress control interface", long_about = None)]
pub struct Cli {
    /// Path to lectern.toml
    #[arg(long, default_value = "configs/lectern.toml")]
    pub config: PathBuf,
    /// Alternative path to the completion database (overrides storage.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Local auth token (checked when LECTERNCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Shows the active policy and store totals
    Status,
    /// Durable unit completions
    #[command(subcommand)]
    Completion(CompletionCommands),
    /// Mirrored watch progress
    #[command(subcommand)]
    Progress(ProgressCommands),
    /// Runs a JSON sample trace through a full watch session
    Replay(ReplayArgs),
    /// Runs integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
}

#[derive(Subcommand, Debug)]
pub enum CompletionCommands {
    /// Lists stored completions, newest first
    List(CompletionListArgs),
    /// Marks a unit completed for a learner (manual override)
    Mark(UnitArgs),
    /// Removes a stored completion
    Revoke(UnitArgs),
    /// Completed units per course for a learner
    Summary(SummaryArgs),
}

#[derive(Args, Debug)]
pub struct CompletionListArgs {
    /// Filter by learner
    #[arg(long)]
    pub user: Option<String>,
    /// Filter by course
    #[arg(long)]
    pub course: Option<String>,
    /// Maximum rows returned
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone)]
pub struct UnitArgs {
    #[arg(long)]
    pub user: String,
    #[arg(long)]
    pub unit: String,
    #[arg(long)]
    pub course: String,
}

impl UnitArgs {
    fn key(&self) -> CompletionKey {
        CompletionKey::new(
            &UserIdentity::new(self.user.clone()),
            &UnitRef::new(self.unit.clone(), self.course.clone()),
        )
    }
}

#[derive(Args, Debug)]
pub struct SummaryArgs {
    #[arg(long)]
    pub user: String,
}

#[derive(Subcommand, Debug)]
pub enum ProgressCommands {
    /// Shows stored progress of a learner on a unit
    Show(ProgressShowArgs),
}

#[derive(Args, Debug)]
pub struct ProgressShowArgs {
    #[arg(long)]
    pub user: String,
    #[arg(long)]
    pub unit: String,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSON file holding an array of watch samples
    pub trace: PathBuf,
    /// Learner id; omit to replay anonymously (nothing is written)
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub unit: String,
    #[arg(long)]
    pub course: String,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Runs basic checks
    Check,
}

pub fn run(cli: Cli) -> Result<()> {
    enforce_token(&cli)?;
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Completion(CompletionCommands::List(args)) => {
            let list = context.completion_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Completion(CompletionCommands::Mark(args)) => {
            let record = context.completion_mark(args)?;
            render(&record, cli.format)?;
        }
        Commands::Completion(CompletionCommands::Revoke(args)) => {
            let result = context.completion_revoke(args)?;
            render(&result, cli.format)?;
        }
        Commands::Completion(CompletionCommands::Summary(args)) => {
            let summary = context.completion_summary(args)?;
            render(&summary, cli.format)?;
        }
        Commands::Progress(ProgressCommands::Show(args)) => {
            let progress = context.progress_show(args)?;
            render(&progress, cli.format)?;
        }
        Commands::Replay(args) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let report = runtime.block_on(context.replay(args))?;
            render(&report, cli.format)?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("LECTERNCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: LecternConfig,
    config_path: PathBuf,
    config_dir: PathBuf,
    database: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_lectern_config(&config_path)?;

        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| config.resolve_path(&config_dir, &config.storage.database));

        Ok(Self {
            config,
            config_path,
            config_dir,
            database,
        })
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let completed_units = if self.database.exists() {
            Some(self.existing_store()?.count_completions()?)
        } else {
            None
        };
        Ok(StatusReport {
            database: self.database.display().to_string(),
            completed_units,
            policy: PolicyStatus::from(&self.config),
        })
    }

    fn completion_list(&self, args: &CompletionListArgs) -> Result<CompletionList> {
        let rows = self.existing_store()?.list_completions(
            args.user.as_deref(),
            args.course.as_deref(),
            args.limit,
        )?;
        Ok(CompletionList { rows })
    }

    fn completion_mark(&self, args: &UnitArgs) -> Result<CompletionRecord> {
        let store = self.writable_store()?;
        let record = CompletionRecord::completed_now(&args.key(), CompletionReason::Manual);
        store.upsert_completion(&record)?;
        info!(target: "lecternctl", key = %record.key(), "completion marked manually");
        Ok(record)
    }

    fn completion_revoke(&self, args: &UnitArgs) -> Result<RevokeResult> {
        let key = args.key();
        self.existing_store()?.delete_completion(&key)?;
        info!(target: "lecternctl", %key, "completion revoked");
        Ok(RevokeResult {
            revoked: key.to_string(),
        })
    }

    fn completion_summary(&self, args: &SummaryArgs) -> Result<CourseSummaryList> {
        let rows = self.existing_store()?.course_summary(&args.user)?;
        Ok(CourseSummaryList {
            user_id: args.user.clone(),
            rows,
        })
    }

    fn progress_show(&self, args: &ProgressShowArgs) -> Result<ProgressList> {
        let rows = self
            .existing_store()?
            .fetch_progress(&args.user, &args.unit)?;
        Ok(ProgressList { rows })
    }

    async fn replay(&self, args: &ReplayArgs) -> Result<ReplayReport> {
        let content = fs::read_to_string(&args.trace)?;
        let samples: Vec<WatchSample> = serde_json::from_str(&content)?;
        if samples.is_empty() {
            return Err(AppError::InvalidTrace(format!(
                "{} holds no samples",
                args.trace.display()
            )));
        }

        let store = self.writable_store()?;
        let runtime = ProgressRuntime::new(self.config.clone(), Arc::new(store));
        let session = runtime
            .open_session(
                args.user.clone().map(UserIdentity::new),
                UnitRef::new(args.unit.clone(), args.course.clone()),
            )
            .await;

        let mut intent_at = None;
        for (index, sample) in samples.iter().enumerate() {
            let update = session.ingest(*sample).await;
            if update.completion_intent {
                intent_at = Some(index);
            }
        }
        session.close().await;
        runtime.shutdown().await;
        debug!(target: "lecternctl", samples = samples.len(), ?intent_at, "trace replayed");

        Ok(ReplayReport {
            samples: samples.len(),
            completion_intent_at: intent_at,
            view: session.snapshot(),
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(self.check_path("lectern.toml", &self.config_path));
        results.push(self.check_directory("config dir", &self.config_dir));
        results.push(self.check_database("completions", &self.database));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(name, format!("{path} not found", path = path.display())),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
        }
        let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE) {
            Ok(conn) => conn,
            Err(err) => return HealthEntry::error(name, format!("failed to open: {err}")),
        };
        let pragma: rusqlite::Result<String> =
            conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
        match pragma {
            Ok(result) if result.eq_ignore_ascii_case("ok") => {}
            Ok(result) => return HealthEntry::warn(name, format!("integrity_check: {result}")),
            Err(err) => return HealthEntry::warn(name, format!("error: {err}")),
        }
        let tables: rusqlite::Result<i64> = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('unit_completions', 'video_progress')",
            [],
            |row| row.get(0),
        );
        match tables {
            Ok(2) => HealthEntry::ok(name, "integrity ok".to_string()),
            Ok(_) => HealthEntry::error(name, "schema incomplete".to_string()),
            Err(err) => HealthEntry::warn(name, format!("error: {err}")),
        }
    }

    fn existing_store(&self) -> Result<SqliteCompletionStore> {
        if !self.database.exists() {
            return Err(AppError::MissingResource(format!(
                "completion database missing: {}",
                self.database.display()
            )));
        }
        Ok(SqliteCompletionStore::builder()
            .path(&self.database)
            .create_if_missing(false)
            .build()?)
    }

    fn writable_store(&self) -> Result<SqliteCompletionStore> {
        let store = SqliteCompletionStore::new(&self.database)?;
        store.initialize()?;
        Ok(store)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_units: Option<usize>,
    pub policy: PolicyStatus,
}

#[derive(Debug, Serialize)]
pub struct PolicyStatus {
    pub threshold_percent: f64,
    pub override_threshold_percent: f64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_open_for_seconds: u64,
    pub breaker_half_open_successes: u32,
    pub max_active_instances: usize,
}

impl From<&LecternConfig> for PolicyStatus {
    fn from(config: &LecternConfig) -> Self {
        Self {
            threshold_percent: config.completion.threshold_percent,
            override_threshold_percent: config.completion.override_threshold_percent,
            max_attempts: config.persistence.max_attempts,
            retry_backoff_ms: config.persistence.retry_backoff_ms,
            breaker_failure_threshold: config.breaker.failure_threshold,
            breaker_open_for_seconds: config.breaker.open_for_seconds,
            breaker_half_open_successes: config.breaker.half_open_successes,
            max_active_instances: config.playback.max_active_instances,
        }
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Database: {}", self.database)];
        match self.completed_units {
            Some(count) => lines.push(format!("Completed units: {count}")),
            None => lines.push("Completed units: database not created yet".to_string()),
        }
        let policy = &self.policy;
        lines.push("Policy:".to_string());
        lines.push(format!(
            "  - Completion at {:.0}% (override from {:.0}%)",
            policy.threshold_percent, policy.override_threshold_percent
        ));
        lines.push(format!(
            "  - {} attempts, {} ms backoff",
            policy.max_attempts, policy.retry_backoff_ms
        ));
        lines.push(format!(
            "  - Breaker: {} failures, open {} s, {} probes",
            policy.breaker_failure_threshold,
            policy.breaker_open_for_seconds,
            policy.breaker_half_open_successes
        ));
        lines.push(format!("  - Players: {}", policy.max_active_instances));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionList {
    pub rows: Vec<CompletionRecord>,
}

impl DisplayFallback for CompletionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No completions found".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format_completion(entry));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for CompletionRecord {
    fn display(&self) -> String {
        format_completion(self)
    }
}

fn format_completion(entry: &CompletionRecord) -> String {
    format!(
        "{user} | {course}/{unit} | completed={completed} | at={at} | source={source}",
        user = entry.user_id,
        course = entry.course_id,
        unit = entry.unit_id,
        completed = entry.completed,
        at = entry.completed_at.format("%Y-%m-%d %H:%M:%S"),
        source = entry.source,
    )
}

#[derive(Debug, Serialize)]
pub struct RevokeResult {
    pub revoked: String,
}

impl DisplayFallback for RevokeResult {
    fn display(&self) -> String {
        format!("Revoked {}", self.revoked)
    }
}

#[derive(Debug, Serialize)]
pub struct CourseSummaryList {
    pub user_id: String,
    pub rows: Vec<CourseCompletionSummary>,
}

impl DisplayFallback for CourseSummaryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No completions for {}", self.user_id);
        }
        let mut lines = vec![format!("Learner {}:", self.user_id)];
        for entry in &self.rows {
            let last = entry
                .last_completed_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  - {}: {} units (last {})",
                entry.course_id, entry.completed_units, last
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProgressList {
    pub rows: Vec<ProgressRecord>,
}

impl DisplayFallback for ProgressList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No progress recorded".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            lines.push(format!(
                "{user} | {course}/{unit} | {pct:.1}% | watched={watched:.0}s of {total:.0}s",
                user = entry.user_id,
                course = entry.course_id,
                unit = entry.unit_id,
                pct = entry.watch_percentage,
                watched = entry.watched_duration_seconds,
                total = entry.total_duration_seconds,
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub samples: usize,
    pub completion_intent_at: Option<usize>,
    pub view: SessionView,
}

impl DisplayFallback for ReplayReport {
    fn display(&self) -> String {
        let view = &self.view;
        let mut lines = vec![format!(
            "Replayed {} samples: {}% watched",
            self.samples, view.display_percentage
        )];
        match self.completion_intent_at {
            Some(index) => lines.push(format!("Completion threshold reached at sample #{index}")),
            None => lines.push("Completion threshold not reached".to_string()),
        }
        let state = &view.completion_state;
        lines.push(format!(
            "Completion: {} (attempts {}, completed {})",
            state.phase, state.attempt.attempts_count, view.is_video_completed
        ));
        if let Some(error) = &state.attempt.last_error {
            lines.push(format!("Last error: {error}"));
        }
        let perf = &view.performance_data;
        lines.push(format!(
            "Writes: {} attempted, {} ok, {} failed, {} rejected",
            perf.writes_attempted, perf.writes_succeeded, perf.writes_failed, perf.writes_rejected
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::CompletionPhase;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let configs_dir = temp.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/lectern.toml", configs_dir.join("lectern.toml")).unwrap();

        let cli = Cli {
            config: configs_dir.join("lectern.toml"),
            database: Some(temp.path().join("data").join("lectern.sqlite")),
            token: None,
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    fn unit_args(user: &str, unit: &str) -> UnitArgs {
        UnitArgs {
            user: user.into(),
            unit: unit.into(),
            course: "course-1".into(),
        }
    }

    #[test]
    fn status_before_and_after_first_completion() {
        let (_temp, context) = prepare_test_context().unwrap();
        let status = context.gather_status().unwrap();
        assert_eq!(status.completed_units, None);
        assert_eq!(status.policy.threshold_percent, 95.0);
        assert_eq!(status.policy.max_attempts, 3);

        context.completion_mark(&unit_args("learner-1", "unit-1")).unwrap();
        let status = context.gather_status().unwrap();
        assert_eq!(status.completed_units, Some(1));
    }

    #[test]
    fn marking_is_idempotent_and_listable() {
        let (_temp, context) = prepare_test_context().unwrap();
        context.completion_mark(&unit_args("learner-1", "unit-1")).unwrap();
        context.completion_mark(&unit_args("learner-1", "unit-1")).unwrap();
        context.completion_mark(&unit_args("learner-1", "unit-2")).unwrap();

        let list = context
            .completion_list(&CompletionListArgs {
                user: Some("learner-1".into()),
                course: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(list.rows.len(), 2);
        assert!(list
            .rows
            .iter()
            .all(|row| row.source == CompletionReason::Manual));

        let summary = context
            .completion_summary(&SummaryArgs {
                user: "learner-1".into(),
            })
            .unwrap();
        assert_eq!(summary.rows[0].completed_units, 2);

        context
            .completion_revoke(&unit_args("learner-1", "unit-2"))
            .unwrap();
        assert!(context
            .completion_revoke(&unit_args("learner-1", "unit-2"))
            .is_err());
    }

    #[test]
    fn listing_without_database_reports_missing_resource() {
        let (_temp, context) = prepare_test_context().unwrap();
        let err = context
            .completion_list(&CompletionListArgs {
                user: None,
                course: None,
                limit: 5,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::MissingResource(_)));
    }

    #[tokio::test]
    async fn replay_runs_trace_through_session() {
        let (temp, context) = prepare_test_context().unwrap();
        let mut samples: Vec<WatchSample> = (0..=60)
            .map(|second| WatchSample::time_update(second as f64 * 2.0, 120.0))
            .collect();
        samples.push(WatchSample::ended(120.0));
        let trace = temp.path().join("trace.json");
        fs::write(&trace, serde_json::to_string(&samples).unwrap()).unwrap();

        let report = context
            .replay(&ReplayArgs {
                trace: trace.clone(),
                user: Some("learner-1".into()),
                unit: "unit-9".into(),
                course: "course-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(report.samples, 62);
        assert_eq!(report.completion_intent_at, Some(57));
        assert!(report.view.is_video_completed);
        assert_eq!(report.view.completion_state.phase, CompletionPhase::Completed);

        let progress = context
            .progress_show(&ProgressShowArgs {
                user: "learner-1".into(),
                unit: "unit-9".into(),
            })
            .unwrap();
        assert_eq!(progress.rows.len(), 1);
        assert_eq!(progress.rows[0].watch_percentage, 100.0);
        assert!(report.display().contains("sample #57"));
    }

    #[tokio::test]
    async fn anonymous_replay_writes_nothing() {
        let (temp, context) = prepare_test_context().unwrap();
        let trace = temp.path().join("trace.json");
        fs::write(
            &trace,
            r#"[
                {"current_time_seconds": 0.0, "duration_seconds": 30.0, "source_event_type": "time_update"},
                {"current_time_seconds": 30.0, "duration_seconds": 30.0, "source_event_type": "ended"}
            ]"#,
        )
        .unwrap();

        let report = context
            .replay(&ReplayArgs {
                trace,
                user: None,
                unit: "unit-1".into(),
                course: "course-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(report.view.display_percentage, 100);
        assert!(!report.view.is_video_completed);
        assert_eq!(context.gather_status().unwrap().completed_units, Some(0));
    }

    #[test]
    fn health_check_flags_schema() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.health_check();
        assert!(matches!(report[0].status, CheckStatus::Ok));
        assert!(matches!(report[2].status, CheckStatus::Warn));

        context.completion_mark(&unit_args("learner-1", "unit-1")).unwrap();
        let report = context.health_check();
        assert!(report
            .iter()
            .all(|entry| matches!(entry.status, CheckStatus::Ok)));
    }
}
