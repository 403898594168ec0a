//! TOML configuration for `fetchmux run`.
//!
//! ```toml
//! state_file = "/var/lib/fetchmux/state.json"
//! output = "-"
//!
//! [tags]
//! okta = 3
//!
//! [[source]]
//! name = "okta1"
//! group = "okta"
//! url = "https://example.okta.com/api/v1/logs"
//! tag = "okta"
//! headers = { Authorization = "SSWS ..." }
//! timestamp_field = "published"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use fetchmux_fetch::{FetchConfig, TagId, fetch_loop, retry, transport};

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub state_file: PathBuf,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// `-` for stdout, otherwise a file opened for append.
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default)]
    pub tags: BTreeMap<String, u16>,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub group: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub url: String,
    /// Tag name, resolved through `[tags]`.
    pub tag: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_since_param")]
    pub since_param: String,
    /// Query parameter carrying the cursor. Unset means the cursor is the
    /// absolute URL of the next page.
    #[serde(default)]
    pub cursor_param: Option<String>,
    #[serde(default)]
    pub limit_param: Option<String>,
    /// JSON pointer to the record array. Empty means the body itself.
    #[serde(default)]
    pub records_pointer: String,
    #[serde(default)]
    pub cursor_pointer: Option<String>,
    /// Top-level key, or a JSON pointer when it starts with `/`.
    pub timestamp_field: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_empty_backoff_secs")]
    pub empty_backoff_secs: u64,
    #[serde(default = "default_partial_backoff_secs")]
    pub partial_backoff_secs: u64,
    /// Defaults to `empty_backoff_secs`.
    #[serde(default)]
    pub error_backoff_secs: Option<u64>,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Replaces the default 425/429 set; 5xx is always retried.
    #[serde(default)]
    pub recoverable_status: Option<Vec<u16>>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seed: bool,
    #[serde(default)]
    pub exclusive_ranges: bool,
}

fn default_flush_interval_secs() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}
fn default_output() -> String {
    "-".to_string()
}
fn default_kind() -> String {
    "json_http".to_string()
}
fn default_since_param() -> String {
    "since".to_string()
}
fn default_page_size() -> usize {
    100
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_burst() -> u32 {
    1
}
fn default_empty_backoff_secs() -> u64 {
    fetch_loop::DEFAULT_EMPTY_BACKOFF.as_secs()
}
fn default_partial_backoff_secs() -> u64 {
    fetch_loop::DEFAULT_PARTIAL_BACKOFF.as_secs()
}
fn default_retry_backoff_secs() -> u64 {
    retry::DEFAULT_BACKOFF.as_secs()
}
fn default_request_timeout_secs() -> u64 {
    transport::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.is_empty() {
            bail!("no [[source]] entries configured");
        }
        if self.flush_interval_secs == 0 {
            bail!("flush_interval_secs must be positive");
        }
        if self.output.is_empty() {
            bail!("output must be \"-\" or a file path");
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            source
                .validate()
                .with_context(|| format!("source {:?}", source.name))?;
            if !seen.insert((source.group.as_str(), source.name.as_str())) {
                bail!(
                    "duplicate source {:?} in group {:?}",
                    source.name,
                    source.group
                );
            }
        }
        Ok(())
    }
}

impl SourceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() || self.group.is_empty() {
            bail!("name and group must be non-empty");
        }
        if self.tag.is_empty() {
            bail!("tag must be non-empty");
        }
        let url = reqwest::Url::parse(&self.url).with_context(|| format!("bad url {:?}", self.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("url scheme must be http or https, got {:?}", url.scheme());
        }
        if self.requests_per_minute == 0 {
            bail!("requests_per_minute must be positive");
        }
        if self.burst == 0 {
            bail!("burst must be positive");
        }
        if self.page_size == 0 {
            bail!("page_size must be positive");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        if self.timestamp_field.is_empty() {
            bail!("timestamp_field must be non-empty");
        }
        if !self.records_pointer.is_empty() && !self.records_pointer.starts_with('/') {
            bail!("records_pointer must be empty or start with '/'");
        }
        if let Some(p) = &self.cursor_pointer {
            if !p.starts_with('/') {
                bail!("cursor_pointer must start with '/'");
            }
        }
        if let Some(codes) = &self.recoverable_status {
            if let Some(bad) = codes.iter().find(|c| !(400..=599).contains(*c)) {
                bail!("recoverable_status {bad} is not an HTTP error status");
            }
        }
        Ok(())
    }

    pub fn fetch_config(&self, tag: TagId) -> FetchConfig {
        let mut config = FetchConfig::new(&self.group, &self.name, tag);
        config.empty_backoff = Duration::from_secs(self.empty_backoff_secs);
        config.partial_backoff = Duration::from_secs(self.partial_backoff_secs);
        config.error_backoff =
            Duration::from_secs(self.error_backoff_secs.unwrap_or(self.empty_backoff_secs));
        config.start_time = self.start_time;
        config.seed = self.seed;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
state_file = "/tmp/state.json"

[tags]
okta = 3

[[source]]
name = "okta1"
group = "okta"
url = "https://example.okta.com/api/v1/logs"
tag = "okta"
timestamp_field = "published"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.flush_interval_secs, DEFAULT_FLUSH_INTERVAL_SECS);
        assert_eq!(config.output, "-");
        assert_eq!(config.tags["okta"], 3);

        let s = &config.sources[0];
        assert_eq!(s.kind, "json_http");
        assert_eq!(s.since_param, "since");
        assert_eq!(s.page_size, 100);
        assert_eq!(s.requests_per_minute, 60);
        assert_eq!(s.burst, 1);
        assert!(s.cursor_param.is_none());
        assert!(!s.seed);

        let fc = s.fetch_config(TagId(3));
        assert_eq!(fc.group, "okta");
        assert_eq!(fc.object, "okta1");
        assert_eq!(fc.empty_backoff, Duration::from_secs(60));
        assert_eq!(fc.partial_backoff, Duration::from_secs(10));
        assert_eq!(fc.error_backoff, Duration::from_secs(60));
    }

    #[test]
    fn full_source_entry_parses() {
        let text = r#"
state_file = "state.json"
flush_interval_secs = 5
output = "/var/log/fetchmux.ndjson"

[tags]
gh = 7

[[source]]
name = "audit"
group = "github"
url = "https://api.github.com/orgs/acme/audit-log"
tag = "gh"
headers = { Authorization = "Bearer x", Accept = "application/vnd.github+json" }
since_param = "after"
cursor_param = "cursor"
limit_param = "per_page"
records_pointer = "/items"
cursor_pointer = "/next"
timestamp_field = "/meta/@timestamp"
page_size = 50
requests_per_minute = 30
burst = 5
empty_backoff_secs = 120
partial_backoff_secs = 15
error_backoff_secs = 30
retry_backoff_secs = 2
max_attempts = 10
recoverable_status = [408, 429]
request_timeout_secs = 10
start_time = "2025-01-01T00:00:00Z"
seed = true
exclusive_ranges = true
"#;
        let config = Config::from_toml(text).unwrap();
        let s = &config.sources[0];
        assert_eq!(s.headers.len(), 2);
        assert_eq!(s.cursor_param.as_deref(), Some("cursor"));
        assert_eq!(s.recoverable_status.as_deref(), Some(&[408, 429][..]));
        assert_eq!(s.max_attempts, Some(10));
        assert!(s.exclusive_ranges);
        let fc = s.fetch_config(TagId(7));
        assert_eq!(fc.error_backoff, Duration::from_secs(30));
        assert_eq!(fc.start_time.unwrap().to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert!(fc.seed);
    }

    #[test]
    fn duplicate_source_is_rejected() {
        let text = format!(
            "{MINIMAL}\n[[source]]\nname = \"okta1\"\ngroup = \"okta\"\nurl = \"https://b.example\"\ntag = \"okta\"\ntimestamp_field = \"t\"\n"
        );
        let err = Config::from_toml(&text).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate source"), "{err:#}");
    }

    #[test]
    fn same_name_in_other_group_is_fine() {
        let text = format!(
            "{MINIMAL}\n[[source]]\nname = \"okta1\"\ngroup = \"other\"\nurl = \"https://b.example\"\ntag = \"okta\"\ntimestamp_field = \"t\"\n"
        );
        assert_eq!(Config::from_toml(&text).unwrap().sources.len(), 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            ("requests_per_minute = 0", "requests_per_minute"),
            ("burst = 0", "burst"),
            ("page_size = 0", "page_size"),
            ("recoverable_status = [200]", "recoverable_status"),
        ];
        for (line, needle) in cases {
            let text = format!("{MINIMAL}{line}\n");
            let err = Config::from_toml(&text).unwrap_err();
            assert!(format!("{err:#}").contains(needle), "{line}: {err:#}");
        }
    }

    #[test]
    fn bad_url_is_rejected() {
        let text = MINIMAL.replace("https://example.okta.com/api/v1/logs", "ftp://example.com");
        let err = Config::from_toml(&text).unwrap_err();
        assert!(format!("{err:#}").contains("scheme"), "{err:#}");

        let text = MINIMAL.replace("https://example.okta.com/api/v1/logs", "not a url");
        assert!(Config::from_toml(&text).is_err());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let text = format!("{MINIMAL}colour = \"blue\"\n");
        assert!(Config::from_toml(&text).is_err());
    }

    #[test]
    fn empty_source_list_is_rejected() {
        let err = Config::from_toml("state_file = \"s.json\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("no [[source]]"));
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }
}
