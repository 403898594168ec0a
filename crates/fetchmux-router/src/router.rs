//! Sub-protocol router: one WebSocket, many independent JSON streams.
//!
//! Lifecycle:
//! 1. `connect`/`negotiate` (client) or `accept` (server) agrees on a
//!    sub-protocol list and creates one inbound queue per name
//! 2. `open_channel` hands out a `SubProtoConn` per wanted name;
//!    `close_channel` drops the unwanted ones
//! 3. `start` spawns the read pump that routes frames by their `type` tag
//! 4. `close` tears down every channel and the connection

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::sink::Sink;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::channel::SubProtoConn;
use crate::error::RouterError;
use crate::frame::{InboundFrame, Negotiation, dedup_names};

type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Upper bound on sending the close frame to a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Shared connection state ─────────────────────────────────────────

/// Per-name routing slot. The queue receiver waits here until opened.
#[derive(Debug)]
struct Slot {
    tx: Option<mpsc::UnboundedSender<serde_json::Value>>,
    rx: Option<mpsc::UnboundedReceiver<serde_json::Value>>,
    active: Arc<AtomicBool>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    fn deactivate(&mut self) -> bool {
        self.tx = None;
        self.rx = None;
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Stop routing but leave an opened channel able to drain its queue.
    fn disconnect(&mut self) {
        self.tx = None;
        self.rx = None;
    }
}

/// State shared between the router handle, the pump, and every channel.
/// Channels hold only a `Weak` to it.
pub(crate) struct Shared {
    writer: Mutex<FrameSink>,
    slots: Mutex<HashMap<String, Slot>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one complete text frame while holding the connection write lock.
    pub(crate) async fn send_text(
        &self,
        text: String,
        timeout: Option<Duration>,
    ) -> Result<(), RouterError> {
        let send = async {
            let mut writer = self.writer.lock().await;
            writer.send(Message::Text(text)).await
        };
        let result = match timeout {
            Some(d) => tokio::time::timeout(d, send)
                .await
                .map_err(|_| RouterError::Timeout)?,
            None => send.await,
        };
        result.map_err(RouterError::from)
    }

    /// Stop routing to `name`; any queued frames are discarded by the owner.
    pub(crate) async fn release(&self, name: &str) {
        if let Some(slot) = self.slots.lock().await.get_mut(name) {
            slot.deactivate();
        }
    }

    async fn route(&self, raw: &[u8]) {
        let frame: InboundFrame = match serde_json::from_slice(raw) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "router: dropping malformed frame");
                return;
            }
        };

        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&frame.subproto) else {
            tracing::debug!(subproto = %frame.subproto, "router: dropping frame for unknown sub-protocol");
            return;
        };
        let delivered = match &slot.tx {
            Some(tx) if slot.active.load(Ordering::Acquire) => tx.send(frame.data).is_ok(),
            _ => {
                tracing::debug!(subproto = %frame.subproto, "router: dropping frame for closed channel");
                return;
            }
        };
        if !delivered {
            tracing::debug!(subproto = %frame.subproto, "router: channel owner went away, closing slot");
            slot.deactivate();
        }
    }

    /// Stop routing to every channel. Frames already queued stay readable;
    /// each channel reports `Eof` once its queue is empty.
    async fn invalidate_all(&self) {
        self.closed.store(true, Ordering::Release);
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            slot.disconnect();
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────

/// Demultiplexes one WebSocket into named `SubProtoConn` channels and
/// serializes their outbound frames back onto it.
pub struct Router {
    shared: Arc<Shared>,
    negotiated: Vec<String>,
    reader: Mutex<Option<FrameStream>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Router {
    /// Dial `url` and negotiate `candidates` with the remote end.
    pub async fn connect<I, S>(url: &str, candidates: I) -> Result<Self, RouterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(RouterError::Transport)?;
        tracing::debug!(url, "router: websocket connected");
        Self::negotiate(ws, candidates).await
    }

    /// Client half of the handshake on an already-upgraded stream.
    ///
    /// Fails if the remote end accepts nothing or answers with a name that
    /// was never offered.
    pub async fn negotiate<T, I, S>(
        mut ws: WebSocketStream<T>,
        candidates: I,
    ) -> Result<Self, RouterError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let offered = dedup_names(candidates);
        if offered.is_empty() {
            return Err(RouterError::NegotiationRejected(
                "no candidate sub-protocols".into(),
            ));
        }

        let offer = Negotiation {
            subs: offered.clone(),
        };
        let text = serde_json::to_string(&offer).map_err(RouterError::Encode)?;
        ws.send(Message::Text(text)).await?;

        let reply = next_text(&mut ws).await?;
        let reply: Negotiation = serde_json::from_str(&reply).map_err(|e| {
            RouterError::NegotiationRejected(format!("malformed negotiation reply: {e}"))
        })?;
        let agreed = dedup_names(&reply.subs);
        if agreed.is_empty() {
            return Err(RouterError::NegotiationRejected(
                "remote accepted no sub-protocols".into(),
            ));
        }
        if let Some(unknown) = agreed.iter().find(|s| !offered.contains(s)) {
            return Err(RouterError::NegotiationRejected(format!(
                "remote accepted unoffered sub-protocol {unknown:?}"
            )));
        }

        tracing::info!(offered = ?offered, negotiated = ?agreed, "router: sub-protocols negotiated");
        Ok(Self::from_parts(ws, agreed))
    }

    /// Server half of the handshake: accept the offered names we support.
    ///
    /// The reply is always sent so the client sees an explicit rejection.
    pub async fn accept<T, I, S>(mut ws: WebSocketStream<T>, supported: I) -> Result<Self, RouterError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let supported = dedup_names(supported);
        let offer = next_text(&mut ws).await?;
        let offer: Negotiation = serde_json::from_str(&offer).map_err(|e| {
            RouterError::NegotiationRejected(format!("malformed negotiation offer: {e}"))
        })?;
        let agreed: Vec<String> = dedup_names(&offer.subs)
            .into_iter()
            .filter(|s| supported.contains(s))
            .collect();

        let reply = Negotiation {
            subs: agreed.clone(),
        };
        let text = serde_json::to_string(&reply).map_err(RouterError::Encode)?;
        ws.send(Message::Text(text)).await?;

        if agreed.is_empty() {
            tracing::warn!(offered = ?offer.subs, "router: no common sub-protocols");
            return Err(RouterError::NegotiationRejected(
                "no common sub-protocols".into(),
            ));
        }
        tracing::info!(negotiated = ?agreed, "router: sub-protocols accepted");
        Ok(Self::from_parts(ws, agreed))
    }

    fn from_parts<T>(ws: WebSocketStream<T>, negotiated: Vec<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let slots = negotiated
            .iter()
            .map(|name| (name.clone(), Slot::new()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                writer: Mutex::new(Box::pin(sink)),
                slots: Mutex::new(slots),
                closed: AtomicBool::new(false),
            }),
            negotiated,
            reader: Mutex::new(Some(Box::pin(stream))),
            pump: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Sub-protocols both ends agreed on, in offer order.
    pub fn negotiated(&self) -> &[String] {
        &self.negotiated
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Hand out the channel for `name`. Each name can be opened once.
    pub async fn open_channel(&self, name: &str) -> Result<SubProtoConn, RouterError> {
        if self.shared.is_closed() {
            return Err(RouterError::Closed);
        }
        let mut slots = self.shared.slots.lock().await;
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| RouterError::NotNegotiated(name.to_owned()))?;
        if !slot.active.load(Ordering::Acquire) {
            return Err(RouterError::AlreadyClosed(name.to_owned()));
        }
        let rx = slot
            .rx
            .take()
            .ok_or_else(|| RouterError::AlreadyOpen(name.to_owned()))?;
        tracing::debug!(subproto = name, "router: channel opened");
        Ok(SubProtoConn::new(
            name.to_owned(),
            rx,
            Arc::clone(&slot.active),
            Arc::downgrade(&self.shared),
        ))
    }

    /// Tear down one channel without touching the others.
    pub async fn close_channel(&self, name: &str) -> Result<(), RouterError> {
        let mut slots = self.shared.slots.lock().await;
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| RouterError::NotNegotiated(name.to_owned()))?;
        if !slot.deactivate() {
            return Err(RouterError::AlreadyClosed(name.to_owned()));
        }
        tracing::debug!(subproto = name, "router: channel closed by router");
        Ok(())
    }

    /// Spawn the read pump. Call after opening the wanted channels.
    pub async fn start(&self) -> Result<(), RouterError> {
        if self.shared.is_closed() {
            return Err(RouterError::Closed);
        }
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(RouterError::AlreadyStarted)?;
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(run_pump(shared, reader, cancel));
        *self.pump.lock().await = Some(handle);
        Ok(())
    }

    /// Close every channel and the connection. A second call fails with `Closed`.
    ///
    /// Channels can still drain frames received before the close.
    pub async fn close(&self) -> Result<(), RouterError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(RouterError::Closed);
        }
        self.cancel.cancel();
        self.shared.invalidate_all().await;

        let goodbye = async {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.send(Message::Close(None)).await {
                tracing::debug!(error = %e, "router: close frame not sent");
            }
            let _ = writer.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await.is_err() {
            tracing::warn!(
                timeout_ms = CLOSE_TIMEOUT.as_millis() as u64,
                "router: peer not reading, dropping connection without close frame"
            );
        }

        if let Some(handle) = self.pump.lock().await.take() {
            let _ = handle.await;
        }
        tracing::debug!("router: closed");
        Ok(())
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read frames until the connection ends or the router is cancelled.
async fn run_pump(shared: Arc<Shared>, mut reader: FrameStream, cancel: CancellationToken) {
    tracing::debug!("router: read pump started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("router: read pump cancelled");
                break;
            }
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => shared.route(text.as_bytes()).await,
                    Some(Ok(Message::Binary(bytes))) => shared.route(&bytes).await,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(frame = ?frame, "router: remote closed connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "router: read error, dropping connection");
                        break;
                    }
                    None => {
                        tracing::debug!("router: connection stream ended");
                        break;
                    }
                }
            }
        }
    }
    shared.invalidate_all().await;
}

/// Next text frame during negotiation, skipping control frames.
async fn next_text<T>(ws: &mut WebSocketStream<T>) -> Result<String, RouterError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(RouterError::NegotiationRejected(
                    "connection closed during negotiation".into(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RouterError::Transport(e)),
        }
    }
}
