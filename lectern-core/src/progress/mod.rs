pub mod aggregator;
pub mod models;

pub use aggregator::{CompletionPolicy, ProgressAggregator};
pub use models::{ProgressUpdate, UnitRef, VideoProgressState};
