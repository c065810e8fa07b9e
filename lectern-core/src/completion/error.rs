use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("completion store path not configured")]
    MissingStore,
    #[error("completion backend error: {0}")]
    Backend(String),
    #[error("blocking store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
    #[error("completion write timed out after {0:?}")]
    Timeout(Duration),
    #[error("completion for {user_id}/{unit_id}/{course_id} not found")]
    NotFound {
        user_id: String,
        unit_id: String,
        course_id: String,
    },
}

pub type CompletionResult<T> = std::result::Result<T, CompletionError>;
