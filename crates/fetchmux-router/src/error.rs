//! Error types for the sub-protocol router.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("sub-protocol {0:?} was not negotiated")]
    NotNegotiated(String),

    #[error("sub-protocol {0:?} is already open")]
    AlreadyOpen(String),

    #[error("sub-protocol {0:?} is already closed")]
    AlreadyClosed(String),

    #[error("router read pump already started")]
    AlreadyStarted,

    #[error("router is closed")]
    Closed,

    #[error("end of stream")]
    Eof,

    #[error("timed out")]
    Timeout,

    #[error("invalid timeout: {0}ms")]
    InvalidTimeout(i64),

    #[error("sub-protocol negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("failed to decode frame payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode frame payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("websocket transport error: {0}")]
    Transport(#[source] tungstenite::Error),
}

impl From<tungstenite::Error> for RouterError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Self::Eof,
            other => Self::Transport(other),
        }
    }
}
