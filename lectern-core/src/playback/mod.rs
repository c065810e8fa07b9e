mod error;
mod source;
mod types;

pub use error::{PlaybackError, PlaybackResult};
pub use source::{PlaybackEventSource, SampleSink, SourceStatus};
pub use types::{PlayerBackend, PlayerEvent, PlayerKind, SampleEventType, WatchSample};
