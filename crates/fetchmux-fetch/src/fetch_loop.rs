//! Per-source polling loop.
//!
//! Each iteration resumes from the persisted checkpoint, walks every page
//! the API offers, forwards each page downstream, and only then moves the
//! checkpoint forward (flushed to disk before the next page is requested).
//! A restart therefore resumes at the first page that was not forwarded.
//!
//! State machine:
//!   Seeding (first backfill only) → Polling ⇄ Paginating
//!   Polling → Backoff(Empty | Partial | Error) → Polling
//!   any → Stopped (cancellation, or a checkpoint that cannot be persisted)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use fetchmux_tracker::{ObjectTracker, TrackedState};

use crate::error::FetchError;
use crate::retry::RetryClient;
use crate::sink::{IngestSink, Record, TagId};
use crate::source::{LogSource, PageQuery};

pub const DEFAULT_EMPTY_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_PARTIAL_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Checkpoint group, usually the vendor.
    pub group: String,
    /// Checkpoint key within the group, usually the configured source name.
    pub object: String,
    pub tag: TagId,
    pub empty_backoff: Duration,
    pub partial_backoff: Duration,
    pub error_backoff: Duration,
    /// Watermark for a source seen for the first time. Defaults to now.
    pub start_time: Option<DateTime<Utc>>,
    /// Request a historical backfill if the source supports one.
    pub seed: bool,
}

impl FetchConfig {
    pub fn new(group: impl Into<String>, object: impl Into<String>, tag: TagId) -> Self {
        Self {
            group: group.into(),
            object: object.into(),
            tag,
            empty_backoff: DEFAULT_EMPTY_BACKOFF,
            partial_backoff: DEFAULT_PARTIAL_BACKOFF,
            error_backoff: DEFAULT_EMPTY_BACKOFF,
            start_time: None,
            seed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReason {
    Empty,
    Partial,
    Error,
}

impl std::fmt::Display for BackoffReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty",
            Self::Partial => "partial",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Seeding,
    Polling,
    Paginating,
    Backoff(BackoffReason),
    Stopped,
}

/// Counters for one poll iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub pages: usize,
    /// Records returned by the API.
    pub fetched: usize,
    /// Records handed to the sink.
    pub forwarded: usize,
    pub last_page_len: usize,
    /// Whether the watermark moved forward during the poll.
    pub advanced: bool,
}

impl PollSummary {
    /// Delay before the next iteration, or `None` to poll again right away.
    ///
    /// A full page that leaves the watermark where it was (more records share
    /// one timestamp than fit a page) is treated like a partial page;
    /// re-polling at once would only fetch the same page again.
    pub fn backoff(&self, page_size: usize, config: &FetchConfig) -> Option<(BackoffReason, Duration)> {
        if self.fetched == 0 {
            Some((BackoffReason::Empty, config.empty_backoff))
        } else if self.last_page_len < page_size || !self.advanced {
            Some((BackoffReason::Partial, config.partial_backoff))
        } else {
            None
        }
    }
}

pub struct FetchLoop {
    config: FetchConfig,
    source: Arc<dyn LogSource>,
    client: RetryClient,
    sink: Arc<dyn IngestSink>,
    tracker: Arc<ObjectTracker>,
    cancel: CancellationToken,
    state: FetchState,
    checkpoint: Option<TrackedState>,
}

impl FetchLoop {
    pub fn new(
        config: FetchConfig,
        source: Arc<dyn LogSource>,
        client: RetryClient,
        sink: Arc<dyn IngestSink>,
        tracker: Arc<ObjectTracker>,
        cancel: CancellationToken,
    ) -> Self {
        let client = client.with_source(source.name(), config.tag);
        Self {
            config,
            source,
            client,
            sink,
            tracker,
            cancel,
            state: FetchState::Polling,
            checkpoint: None,
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Poll until cancelled.
    ///
    /// Request, decode, and ingest failures are logged and retried after
    /// `error_backoff`. A checkpoint that cannot be persisted stops the
    /// loop with an error.
    pub async fn run(mut self) -> Result<(), FetchError> {
        tracing::info!(
            source = self.source.name(),
            group = %self.config.group,
            object = %self.config.object,
            tag = %self.config.tag,
            "fetch loop started"
        );

        while !self.cancel.is_cancelled() {
            let delay = match self.poll_once().await {
                Ok(summary) => summary.backoff(self.source.page_size(), &self.config),
                Err(FetchError::Cancelled) => break,
                Err(e @ FetchError::Checkpoint(_)) => {
                    tracing::error!(
                        source = self.source.name(),
                        tag = %self.config.tag,
                        error = %e,
                        "checkpoint failure, stopping fetch loop"
                    );
                    self.transition(FetchState::Stopped);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        source = self.source.name(),
                        tag = %self.config.tag,
                        status = e.status().map(|s| s.as_u16()),
                        error = %e,
                        "poll failed, checkpoint not advanced"
                    );
                    Some((BackoffReason::Error, self.config.error_backoff))
                }
            };

            if let Some((reason, wait)) = delay {
                self.transition(FetchState::Backoff(reason));
                tracing::debug!(
                    source = self.source.name(),
                    reason = %reason,
                    wait_ms = wait.as_millis() as u64,
                    "backing off"
                );
                if !self.sleep(wait).await {
                    break;
                }
            }
        }

        self.transition(FetchState::Stopped);
        tracing::info!(source = self.source.name(), "fetch loop stopped");
        Ok(())
    }

    /// One iteration: fetch every available page starting at the checkpoint.
    pub async fn poll_once(&mut self) -> Result<PollSummary, FetchError> {
        let mut checkpoint = self.checkpoint().await?;
        if self.state != FetchState::Seeding {
            self.transition(FetchState::Polling);
        }

        let tag = self.config.tag;
        let exclusive = self.source.exclusive_ranges();
        let mut cursor = Some(checkpoint.key.clone()).filter(|k| !k.is_empty());
        let mut summary = PollSummary::default();
        let started_at = checkpoint.latest_time;
        tracing::debug!(
            source = self.source.name(),
            watermark = %checkpoint.latest_time,
            resume_cursor = cursor.is_some(),
            "poll started"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let query = PageQuery {
                since: checkpoint.latest_time,
                cursor: cursor.as_deref(),
            };
            let request = self.source.build_request(&query)?;
            let response = self.client.execute(request, &self.cancel).await?;
            let page = self.source.decode_page(response.body())?;

            let page_len = page.records.len();
            let page_max = page.records.iter().map(|r| r.timestamp).max();
            let records: Vec<Record> = page
                .records
                .into_iter()
                .filter(|r| !exclusive || r.timestamp > checkpoint.latest_time)
                .map(|r| Record {
                    tag,
                    timestamp: r.timestamp,
                    data: r.data,
                })
                .collect();
            let forwarded = records.len();
            if forwarded > 0 {
                self.sink.process_batch(&self.cancel, records).await?;
            }

            let next_cursor = page.next_cursor.filter(|c| !c.is_empty());
            let watermark = page_max.map_or(checkpoint.latest_time, |m| m.max(checkpoint.latest_time));
            let next = TrackedState {
                updated: Utc::now(),
                latest_time: watermark,
                key: next_cursor.clone().unwrap_or_default(),
            };
            if page_len > 0 || next.key != checkpoint.key {
                self.tracker
                    .set(&self.config.group, &self.config.object, next.clone(), true)
                    .await
                    .map_err(FetchError::Checkpoint)?;
                if watermark > checkpoint.latest_time {
                    tracing::debug!(source = self.source.name(), watermark = %watermark, "watermark advanced");
                }
                checkpoint = next;
                self.checkpoint = Some(checkpoint.clone());
            }

            summary.pages += 1;
            summary.fetched += page_len;
            summary.forwarded += forwarded;
            summary.last_page_len = page_len;
            summary.advanced = checkpoint.latest_time > started_at;

            match next_cursor {
                Some(c) => {
                    self.transition(FetchState::Paginating);
                    cursor = Some(c);
                }
                None => break,
            }
        }

        tracing::info!(
            source = self.source.name(),
            pages = summary.pages,
            records = summary.fetched,
            forwarded = summary.forwarded,
            watermark = %checkpoint.latest_time,
            "poll complete"
        );
        Ok(summary)
    }

    /// Load the checkpoint, seeding and persisting one on first sight.
    async fn checkpoint(&mut self) -> Result<TrackedState, FetchError> {
        if let Some(cp) = &self.checkpoint {
            return Ok(cp.clone());
        }
        let group = self.config.group.clone();
        let object = self.config.object.clone();

        let cp = match self.tracker.get(&group, &object).await {
            Some(cp) => {
                tracing::info!(
                    source = self.source.name(),
                    watermark = %cp.latest_time,
                    resume_cursor = !cp.key.is_empty(),
                    "resuming from checkpoint"
                );
                cp
            }
            None => {
                let backfill = self.config.seed && self.source.supports_seeding();
                let start = match (self.config.start_time, backfill) {
                    (Some(t), _) => t,
                    (None, true) => DateTime::<Utc>::UNIX_EPOCH,
                    (None, false) => Utc::now(),
                };
                if backfill {
                    self.transition(FetchState::Seeding);
                }
                let cp = TrackedState::seeded(start);
                self.tracker
                    .set(&group, &object, cp.clone(), true)
                    .await
                    .map_err(FetchError::Checkpoint)?;
                tracing::info!(source = self.source.name(), start = %start, backfill, "seeded new checkpoint");
                cp
            }
        };
        self.checkpoint = Some(cp.clone());
        Ok(cp)
    }

    fn transition(&mut self, next: FetchState) {
        if self.state != next {
            tracing::debug!(source = self.source.name(), from = ?self.state, to = ?next, "fetch state change");
            self.state = next;
        }
    }

    /// Returns false if cancelled before `wait` elapsed.
    async fn sleep(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}
