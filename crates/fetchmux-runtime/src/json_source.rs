//! Config-driven `LogSource` for JSON-over-HTTP log APIs.
//!
//! Records and the continuation cursor are located with RFC 6901 JSON
//! pointers. Timestamps may be RFC 3339 strings or epoch seconds /
//! milliseconds.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde_json::Value;

use fetchmux_fetch::{HttpRequest, LogSource, Page, PageQuery, SourceError, SourceRecord};

use crate::config::SourceConfig;

/// Epoch values above this are taken as milliseconds (year 5138 in seconds).
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone)]
pub struct JsonHttpSource {
    name: String,
    base: Url,
    headers: HeaderMap,
    since_param: String,
    cursor_param: Option<String>,
    limit_param: Option<String>,
    records_pointer: String,
    cursor_pointer: Option<String>,
    timestamp_field: String,
    page_size: usize,
    seeding: bool,
    exclusive: bool,
}

impl JsonHttpSource {
    pub fn from_config(cfg: &SourceConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&cfg.url)?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &cfg.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| anyhow::anyhow!("bad header name {name:?}: {e}"))?;
            let mut value = HeaderValue::try_from(value.as_str())
                .map_err(|e| anyhow::anyhow!("bad value for header {name}: {e}"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
        Ok(Self {
            name: cfg.name.clone(),
            base,
            headers,
            since_param: cfg.since_param.clone(),
            cursor_param: cfg.cursor_param.clone(),
            limit_param: cfg.limit_param.clone(),
            records_pointer: cfg.records_pointer.clone(),
            cursor_pointer: cfg.cursor_pointer.clone(),
            timestamp_field: cfg.timestamp_field.clone(),
            page_size: cfg.page_size,
            seeding: cfg.seed,
            exclusive: cfg.exclusive_ranges,
        })
    }

    /// Registry constructor for the `json_http` kind.
    pub fn factory(cfg: &SourceConfig) -> anyhow::Result<Arc<dyn LogSource>> {
        Ok(Arc::new(Self::from_config(cfg)?))
    }

    fn url_for(&self, query: &PageQuery<'_>) -> Result<Url, SourceError> {
        let mut url = match (query.cursor, &self.cursor_param) {
            (Some(next), None) => {
                return Url::parse(next)
                    .map_err(|e| SourceError::Build(format!("cursor is not a url: {e}")));
            }
            _ => self.base.clone(),
        };
        {
            let mut pairs = url.query_pairs_mut();
            match (query.cursor, &self.cursor_param) {
                (Some(cursor), Some(param)) => {
                    pairs.append_pair(param, cursor);
                }
                _ => {
                    let since = query.since.to_rfc3339_opts(SecondsFormat::AutoSi, true);
                    pairs.append_pair(&self.since_param, &since);
                }
            }
            if let Some(limit) = &self.limit_param {
                pairs.append_pair(limit, &self.page_size.to_string());
            }
        }
        Ok(url)
    }

    fn timestamp(&self, record: &Value) -> Option<DateTime<Utc>> {
        let raw = if self.timestamp_field.starts_with('/') {
            record.pointer(&self.timestamp_field)
        } else {
            record.get(&self.timestamp_field)
        }?;
        parse_timestamp(raw)
    }
}

impl LogSource for JsonHttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_request(&self, query: &PageQuery<'_>) -> Result<HttpRequest, SourceError> {
        let url = self.url_for(query)?;
        let mut request = http::Request::get(url.as_str())
            .body(Bytes::new())
            .map_err(|e| SourceError::Build(e.to_string()))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }

    fn decode_page(&self, body: &[u8]) -> Result<Page, SourceError> {
        let root: Value =
            serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))?;
        let items = root.pointer(&self.records_pointer).ok_or_else(|| {
            SourceError::Decode(format!("no value at {:?}", self.records_pointer))
        })?;
        let items = match items {
            Value::Array(items) => items.as_slice(),
            Value::Null => &[],
            other => {
                return Err(SourceError::Decode(format!(
                    "expected an array of records, found {}",
                    kind_of(other)
                )));
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let timestamp = self.timestamp(item).ok_or_else(|| {
                SourceError::Decode(format!(
                    "record {idx}: missing or unparseable {:?}",
                    self.timestamp_field
                ))
            })?;
            records.push(SourceRecord {
                timestamp,
                data: item.clone(),
            });
        }

        let next_cursor = self
            .cursor_pointer
            .as_deref()
            .and_then(|p| root.pointer(p))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        Ok(Page {
            records,
            next_cursor,
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn supports_seeding(&self) -> bool {
        self.seeding
    }

    fn exclusive_ranges(&self) -> bool {
        self.exclusive
    }
}

pub fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => {
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(t.with_timezone(&Utc));
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
