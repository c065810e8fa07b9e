use thiserror::Error;

pub type PlaybackResult<T> = Result<T, PlaybackError>;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("player backend error: {0}")]
    Backend(String),
    #[error("malformed player message: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("player already torn down")]
    TornDown,
}
