//! What a polled log API has to provide to the fetch loop.

use chrono::{DateTime, Utc};

use crate::error::SourceError;
use crate::transport::HttpRequest;

/// Position the next request should resume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery<'a> {
    /// Lower time bound: the current watermark.
    pub since: DateTime<Utc>,
    /// Opaque continuation token from the previous page, if paginating.
    pub cursor: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// One decoded response. `next_cursor` is `None` (or empty) on the last page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    pub next_cursor: Option<String>,
}

pub trait LogSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn build_request(&self, query: &PageQuery<'_>) -> Result<HttpRequest, SourceError>;

    fn decode_page(&self, body: &[u8]) -> Result<Page, SourceError>;

    /// Records per full page; a shorter page means the source is caught up.
    fn page_size(&self) -> usize;

    /// Whether a fresh checkpoint may backfill from the configured start.
    fn supports_seeding(&self) -> bool {
        false
    }

    /// Whether the API guarantees strictly increasing, non-overlapping
    /// ranges. Only then are records at or before the watermark dropped;
    /// otherwise they are forwarded again.
    ///
    /// An inclusive source with more than `page_size` records at a single
    /// timestamp and no cursor cannot get past that timestamp; the loop
    /// backs off instead of re-polling at once.
    fn exclusive_ranges(&self) -> bool {
        false
    }
}
