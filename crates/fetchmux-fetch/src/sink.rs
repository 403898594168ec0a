//! Downstream ingestion: tag resolution and record sinks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ResolveError, SinkError};

/// Numeric tag identifier attached to every forwarded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagId(pub u16);

impl std::fmt::Display for TagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A record ready for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub tag: TagId,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Accept a batch. An error means none of it should be considered
    /// durable and the caller will re-fetch.
    async fn process_batch(
        &self,
        cancel: &CancellationToken,
        records: Vec<Record>,
    ) -> Result<(), SinkError>;

    async fn process_one(
        &self,
        cancel: &CancellationToken,
        record: Record,
    ) -> Result<(), SinkError> {
        self.process_batch(cancel, vec![record]).await
    }
}

pub trait TagResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<TagId, ResolveError>;
}

/// Tag names: non-empty, ASCII alphanumerics plus `-`, `_` and `.`.
pub fn validate_tag_name(name: &str) -> Result<(), ResolveError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(ResolveError::InvalidName(name.to_string()))
    }
}

/// Fixed name-to-id table, usually loaded from config.
#[derive(Debug, Clone, Default)]
pub struct StaticTagResolver {
    tags: HashMap<String, TagId>,
}

impl StaticTagResolver {
    pub fn new<I, S>(tags: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        let mut map = HashMap::new();
        for (name, id) in tags {
            let name = name.into();
            validate_tag_name(&name)?;
            map.insert(name, TagId(id));
        }
        Ok(Self { tags: map })
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl TagResolver for StaticTagResolver {
    fn resolve(&self, name: &str) -> Result<TagId, ResolveError> {
        validate_tag_name(name)?;
        self.tags
            .get(name)
            .copied()
            .ok_or_else(|| ResolveError::Unknown(name.to_string()))
    }
}

/// Writes one JSON object per record per line to an async writer.
///
/// A batch is encoded fully before anything is written, so an encode
/// failure writes nothing.
#[derive(Debug)]
pub struct NdjsonSink<W> {
    writer: Mutex<W>,
}

impl<W> NdjsonSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> IngestSink for NdjsonSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn process_batch(
        &self,
        cancel: &CancellationToken,
        records: Vec<Record>,
    ) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        let mut buf = Vec::with_capacity(records.len() * 128);
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        tracing::trace!(records = records.len(), bytes = buf.len(), "ndjson batch written");
        Ok(())
    }
}
