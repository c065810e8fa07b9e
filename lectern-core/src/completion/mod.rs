mod controller;
mod error;
mod models;
mod store;

pub use controller::{CompletionController, PersistencePolicy, SAVE_FAILED_MESSAGE};
pub use error::{CompletionError, CompletionResult};
pub use models::{
    CompletionAttemptState, CompletionKey, CompletionOutcome, CompletionPhase, CompletionReason,
    CompletionRecord, CompletionSnapshot, CourseCompletionSummary, ProgressRecord, UserIdentity,
};
pub use store::{CompletionWriter, SqliteCompletionStore, SqliteCompletionStoreBuilder};
