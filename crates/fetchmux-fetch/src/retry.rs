//! Rate-limited HTTP client that retries transient statuses.
//!
//! Every attempt first takes a token from the limiter, then goes through
//! the transport. Responses are classified as:
//! - 2xx: returned
//! - recoverable (425, 429, any 5xx by default): fixed backoff, then retry
//! - anything else: fatal, returned with a truncated body
//!
//! Waits on the limiter and on the backoff both observe the cancel token.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::error::RetryError;
use crate::rate_limit::RateLimiter;
use crate::sink::TagId;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_RECOVERABLE: [u16; 2] = [425, 429];

const ERROR_BODY_LIMIT: usize = 512;

pub struct RetryClient {
    transport: Arc<dyn HttpTransport>,
    limiter: Option<Arc<RateLimiter>>,
    recoverable: BTreeSet<u16>,
    backoff: Duration,
    max_attempts: Option<u32>,
    source: String,
    tag: Option<TagId>,
}

impl std::fmt::Debug for RetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryClient")
            .field("limiter", &self.limiter)
            .field("recoverable", &self.recoverable)
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .field("source", &self.source)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct RetryClientBuilder {
    transport: Option<Arc<dyn HttpTransport>>,
    limiter: Option<Arc<RateLimiter>>,
    recoverable: Option<BTreeSet<u16>>,
    backoff: Option<Duration>,
    max_attempts: Option<u32>,
}

impl RetryClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Replace the default recoverable status set. 5xx is always recoverable.
    pub fn recoverable_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.recoverable = Some(statuses.into_iter().collect());
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Bound the number of attempts. Unbounded when unset.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn build(self) -> Result<RetryClient, RetryError> {
        let transport = self
            .transport
            .ok_or(RetryError::Unconfigured("no http transport"))?;
        Ok(RetryClient {
            transport,
            limiter: self.limiter,
            recoverable: self
                .recoverable
                .unwrap_or_else(|| DEFAULT_RECOVERABLE.into_iter().collect()),
            backoff: self.backoff.unwrap_or(DEFAULT_BACKOFF),
            max_attempts: self.max_attempts,
            source: String::new(),
            tag: None,
        })
    }
}

impl RetryClient {
    pub fn builder() -> RetryClientBuilder {
        RetryClientBuilder::default()
    }

    /// Name the source and tag this client fetches for; both appear on
    /// every retry log line.
    pub fn with_source(mut self, source: impl Into<String>, tag: TagId) -> Self {
        self.source = source.into();
        self.tag = Some(tag);
        self
    }

    pub fn is_recoverable(&self, status: StatusCode) -> bool {
        status.is_server_error() || self.recoverable.contains(&status.as_u16())
    }

    /// Send `request` until it succeeds, fails fatally, or `cancel` fires.
    ///
    /// The request is rebuilt from its parts for every attempt; extensions
    /// are not carried over.
    pub async fn execute(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, RetryError> {
        let (parts, body) = request.into_parts();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match &self.limiter {
                Some(limiter) => limiter.acquire(cancel).await?,
                None if cancel.is_cancelled() => return Err(RetryError::Cancelled),
                None => {}
            }

            let mut req = http::Request::new(body.clone());
            *req.method_mut() = parts.method.clone();
            *req.uri_mut() = parts.uri.clone();
            *req.version_mut() = parts.version;
            *req.headers_mut() = parts.headers.clone();

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                r = self.transport.execute(req) => r?,
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if !self.is_recoverable(status) {
                return Err(RetryError::Status {
                    status,
                    body: truncate_body(response.body()),
                });
            }
            drop(response);

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RetryError::Exhausted {
                    status,
                    attempts: attempt,
                });
            }

            tracing::warn!(
                source = %self.source,
                tag = self.tag.map(|t| t.0),
                uri = %parts.uri,
                status = status.as_u16(),
                attempt,
                backoff_ms = self.backoff.as_millis() as u64,
                "recoverable status, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use bytes::Bytes;

    fn get(uri: &str) -> HttpRequest {
        http::Request::get(uri).body(Bytes::new()).unwrap()
    }

    fn client(transport: Arc<ScriptedTransport>) -> RetryClientBuilder {
        RetryClient::builder().transport(transport)
    }

    #[test]
    fn build_without_transport_is_unconfigured() {
        let err = RetryClient::builder().build().unwrap_err();
        assert!(matches!(err, RetryError::Unconfigured(_)));
    }

    #[test]
    fn default_classification() {
        let t = Arc::new(ScriptedTransport::new(Vec::<(u16, &str)>::new(), (200, "")));
        let c = client(t).build().unwrap();
        for code in [425, 429, 500, 502, 503, 599] {
            assert!(c.is_recoverable(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [400, 401, 403, 404, 410] {
            assert!(!c.is_recoverable(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }

    #[test]
    fn custom_set_keeps_5xx() {
        let t = Arc::new(ScriptedTransport::new(Vec::<(u16, &str)>::new(), (200, "")));
        let c = client(t).recoverable_statuses([408]).build().unwrap();
        assert!(c.is_recoverable(StatusCode::REQUEST_TIMEOUT));
        assert!(c.is_recoverable(StatusCode::BAD_GATEWAY));
        assert!(!c.is_recoverable(StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let t = Arc::new(ScriptedTransport::new(
            [(429, "slow down"), (503, "busy"), (200, "ok")],
            (500, ""),
        ));
        let c = client(t.clone()).build().unwrap();
        let started = tokio::time::Instant::now();

        let resp = c
            .execute(get("http://logs.test/v1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"ok");
        assert_eq!(t.calls(), 3);
        assert!(started.elapsed() >= DEFAULT_BACKOFF * 2);
    }

    #[tokio::test]
    async fn fatal_status_is_not_retried() {
        let t = Arc::new(ScriptedTransport::new([(403, "forbidden")], (200, "")));
        let c = client(t.clone()).build().unwrap();
        let err = c
            .execute(get("http://logs.test/v1"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RetryError::Status { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempts_give_up() {
        let t = Arc::new(ScriptedTransport::new(
            [(500, ""), (502, ""), (200, "")],
            (200, ""),
        ));
        let c = client(t.clone()).max_attempts(2).build().unwrap();
        let err = c
            .execute(get("http://logs.test/v1"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetryError::Exhausted { status, attempts: 2 } if status == StatusCode::BAD_GATEWAY
        ));
        assert_eq!(t.calls(), 2);
    }

    #[tokio::test]
    async fn cancel_during_backoff() {
        let t = Arc::new(ScriptedTransport::new(Vec::<(u16, &str)>::new(), (503, "")));
        let c = client(t.clone())
            .backoff(Duration::from_secs(3600))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            c.execute(get("http://logs.test/v1"), &cancel),
        )
        .await
        .expect("cancel must interrupt the backoff")
        .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled));
        assert_eq!(t.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_takes_a_token() {
        let t = Arc::new(ScriptedTransport::new([(429, "")], (200, "")));
        let limiter = Arc::new(RateLimiter::per_minute(60, 1));
        let c = client(t.clone())
            .rate_limiter(limiter)
            .backoff(Duration::ZERO)
            .build()
            .unwrap();
        let started = tokio::time::Instant::now();
        c.execute(get("http://logs.test/v1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(t.calls(), 2);
        assert!(started.elapsed() >= Duration::from_millis(990));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let out = truncate_body(body.as_bytes());
        assert_eq!(out.len(), ERROR_BODY_LIMIT + 3);
        assert!(out.ends_with("..."));
    }
}
