use std::time::Duration;

use thiserror::Error;

use crate::hash::Hash32;
use crate::time::Timestamp;

/// Errors arising from timestamp and time range construction.
#[derive(Debug, Error)]
pub enum TimeError {
    #[error("timestamp '{0}' carries no UTC offset")]
    MissingTimezone(String),

    #[error("could not parse '{0}' as a timestamp")]
    Parse(String),

    #[error("time range start {start} is after end {end}")]
    Inverted { start: Timestamp, end: Timestamp },
}

/// Errors arising from dataset metadata construction.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("static datasets cannot declare a time level")]
    TimeLevelOnStatic,

    #[error("no predecessor registered under '{0}'")]
    NoSuchPredecessor(String),

    #[error("engine '{expected}' does not own this metadata (found '{found}')")]
    EngineMismatch { expected: String, found: String },
}

/// Errors arising from payload frame construction and combination.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame index must be strictly increasing (row {0})")]
    UnsortedIndex(usize),

    #[error("column '{name}' has {values} values for an index of {index} rows")]
    LengthMismatch {
        name: String,
        values: usize,
        index: usize,
    },

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),
}

/// Errors raised by completion checkers.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Structured error codes returned by persistence engines.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dataset {0} not found")]
    NotFound(Hash32),

    #[error("append overlaps existing data: new index starts at {new_start}, existing data ends at {existing_end}")]
    AppendOverlap {
        new_start: Timestamp,
        existing_end: Timestamp,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient engine failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("operation '{0}' is not supported for static datasets")]
    StaticDataset(&'static str),

    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Backend(e.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Backend(e.into())
    }
}

/// Errors attributed to a single task during a run.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("upstream '{0}' is not complete")]
    UpstreamIncomplete(String),

    #[error("user function failed: {0}")]
    UserFunction(#[source] anyhow::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("{0}")]
    Incomplete(String),

    #[error("task exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("run was cancelled before this task was dispatched")]
    Cancelled,
}
