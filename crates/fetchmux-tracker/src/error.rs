//! Error types for the checkpoint tracker.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("checkpoint file {path} is corrupt: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(
        "non-monotonic watermark for {group}/{key}: current={current}, attempted={attempted}"
    )]
    NonMonotonic {
        group: String,
        key: String,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}
