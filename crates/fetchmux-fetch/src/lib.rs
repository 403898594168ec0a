//! fetchmux-fetch: rate-limited, checkpointed polling of paginated log APIs.

pub mod error;
pub mod fetch_loop;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod source;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{
    Cancelled, FetchError, ResolveError, RetryError, SinkError, SourceError, TransportError,
};
pub use fetch_loop::{BackoffReason, FetchConfig, FetchLoop, FetchState, PollSummary};
pub use rate_limit::RateLimiter;
pub use retry::{RetryClient, RetryClientBuilder};
pub use sink::{IngestSink, NdjsonSink, Record, StaticTagResolver, TagId, TagResolver};
pub use source::{LogSource, Page, PageQuery, SourceRecord};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
