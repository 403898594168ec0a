//! Error types shared across the fetch pipeline.

use http::StatusCode;
use thiserror::Error;

use fetchmux_tracker::TrackerError;

/// A cancellable wait observed the shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("retry client is not configured: {0}")]
    Unconfigured(&'static str),

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("non-recoverable status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("gave up after {attempts} attempts, last status {status}")]
    Exhausted { status: StatusCode, attempts: u32 },
}

impl From<Cancelled> for RetryError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to build request: {0}")]
    Build(String),

    #[error("failed to decode page: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("ingest cancelled")]
    Cancelled,

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("ingest io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ingest rejected batch: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid tag name {0:?}")]
    InvalidName(String),

    #[error("unknown tag {0:?}")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch loop cancelled")]
    Cancelled,

    #[error("request failed: {0}")]
    Request(#[source] RetryError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("downstream ingest failed: {0}")]
    Sink(#[source] SinkError),

    #[error("checkpoint persistence failed: {0}")]
    Checkpoint(#[source] TrackerError),
}

impl FetchError {
    /// HTTP status behind a request failure, if there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(RetryError::Status { status, .. })
            | Self::Request(RetryError::Exhausted { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

impl From<RetryError> for FetchError {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Cancelled => Self::Cancelled,
            other => Self::Request(other),
        }
    }
}

impl From<SinkError> for FetchError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Cancelled => Self::Cancelled,
            other => Self::Sink(other),
        }
    }
}
