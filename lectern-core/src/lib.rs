pub mod completion;
pub mod config;
pub mod error;
pub mod metrics;
pub mod playback;
pub mod progress;
pub mod resilience;
pub mod session;
pub mod sqlite;
mod sync;

pub use completion::{
    CompletionAttemptState, CompletionController, CompletionError, CompletionKey,
    CompletionOutcome, CompletionPhase, CompletionReason, CompletionRecord, CompletionResult,
    CompletionSnapshot, CompletionWriter, CourseCompletionSummary, PersistencePolicy,
    ProgressRecord, SqliteCompletionStore, SqliteCompletionStoreBuilder, UserIdentity,
};
pub use config::{
    load_lectern_config, BreakerSection, CompletionSection, LecternConfig, PersistenceSection,
    PlaybackSection, StorageSection,
};
pub use error::{ConfigError, Result};
pub use metrics::PerformanceData;
pub use playback::{
    PlaybackError, PlaybackEventSource, PlaybackResult, PlayerBackend, PlayerEvent, PlayerKind,
    SampleEventType, SampleSink, SourceStatus, WatchSample,
};
pub use progress::{
    CompletionPolicy, ProgressAggregator, ProgressUpdate, UnitRef, VideoProgressState,
};
pub use resilience::{
    ActiveInstance, BreakerOutcome, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitState, InstanceRegistry, ManagedInstance,
    COMPLETION_WRITE_OPERATION, PROGRESS_WRITE_OPERATION,
};
pub use session::{ProgressRuntime, SessionView, VideoSession};
