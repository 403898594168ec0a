//! One logical sub-protocol stream carried over a shared router connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::RouterError;
use crate::frame::OutboundFrame;
use crate::router::Shared;

/// Convert a signed millisecond timeout into a channel timeout.
///
/// Negative values are invalid; zero means block indefinitely.
pub fn timeout_from_millis(ms: i64) -> Result<Option<Duration>, RouterError> {
    match ms {
        ms if ms < 0 => Err(RouterError::InvalidTimeout(ms)),
        0 => Ok(None),
        ms => Ok(Some(Duration::from_millis(ms as u64))),
    }
}

/// Typed, closable, timeout-capable view of one negotiated sub-protocol.
///
/// The owner is the only reader; the router pump is the only writer into
/// the inbound queue. Outbound frames go through the router's write lock.
#[derive(Debug)]
pub struct SubProtoConn {
    name: String,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
    active: Arc<AtomicBool>,
    timeout: Option<Duration>,
    router: Weak<Shared>,
}

impl SubProtoConn {
    pub(crate) fn new(
        name: String,
        rx: mpsc::UnboundedReceiver<serde_json::Value>,
        active: Arc<AtomicBool>,
        router: Weak<Shared>,
    ) -> Self {
        Self {
            name,
            rx,
            active,
            timeout: None,
            router,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False after `close`, or once the queue has drained after the
    /// connection went away.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the per-operation timeout. `None` blocks indefinitely.
    ///
    /// Applies to subsequent reads; for writes it bounds the wait for the
    /// connection write lock plus the send, which is best-effort only.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|d| !d.is_zero());
    }

    /// Wait for the next frame and decode its payload into `T`.
    ///
    /// A `Timeout` leaves the channel usable. After the connection goes away
    /// frames already received are still returned in order; `Eof` follows
    /// once they are consumed.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, RouterError> {
        if !self.is_active() {
            return Err(RouterError::Eof);
        }
        let next = match self.timeout {
            Some(d) => tokio::time::timeout(d, self.rx.recv())
                .await
                .map_err(|_| RouterError::Timeout)?,
            None => self.rx.recv().await,
        };
        match next {
            Some(value) => serde_json::from_value(value).map_err(RouterError::Decode),
            None => {
                self.active.store(false, Ordering::Release);
                Err(RouterError::Eof)
            }
        }
    }

    /// Tag `src` with this channel's name and send it on the shared connection.
    pub async fn write_json<T: Serialize + ?Sized>(&self, src: &T) -> Result<(), RouterError> {
        if !self.is_active() {
            return Err(RouterError::Eof);
        }
        let shared = self.router.upgrade().ok_or(RouterError::Eof)?;
        if shared.is_closed() {
            return Err(RouterError::Eof);
        }
        let frame = OutboundFrame {
            subproto: &self.name,
            data: src,
        };
        let text = serde_json::to_string(&frame).map_err(RouterError::Encode)?;
        shared.send_text(text, self.timeout).await
    }

    /// Deactivate the channel and discard anything still queued inbound.
    ///
    /// A second call fails with `Eof`. Writes already handed to the
    /// connection are not affected.
    pub async fn close(&mut self) -> Result<(), RouterError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Err(RouterError::Eof);
        }
        if let Some(shared) = self.router.upgrade() {
            shared.release(&self.name).await;
        }
        self.rx.close();
        let mut drained = 0usize;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        tracing::debug!(subproto = %self.name, drained, "channel closed");
        Ok(())
    }
}
