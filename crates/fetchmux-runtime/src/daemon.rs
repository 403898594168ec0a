//! `fetchmux run`: one fetch loop per configured source.
//!
//! Startup resolves every tag and builds every source up front; any
//! failure there is fatal before a single request is sent. At runtime the
//! loops share one checkpoint tracker and one sink. A loop that stops on a
//! checkpoint failure does not take the others down. A periodic task
//! flushes the tracker. On SIGINT/SIGTERM the shared token is cancelled,
//! every loop is joined, and the tracker is flushed one last time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use fetchmux_fetch::{
    FetchError, FetchLoop, IngestSink, NdjsonSink, RateLimiter, ReqwestTransport, RetryClient,
    StaticTagResolver, TagResolver,
};
use fetchmux_tracker::ObjectTracker;

use crate::config::{Config, SourceConfig};
use crate::registry::SourceRegistry;

/// Run until SIGINT or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    run_until(config, SourceRegistry::with_builtin(), shutdown_signal()).await
}

/// Run until `shutdown` resolves or every fetch loop has stopped.
pub async fn run_until(
    config: Config,
    registry: SourceRegistry,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let tracker = Arc::new(
        ObjectTracker::open(&config.state_file)
            .await
            .with_context(|| format!("failed to open state file {}", config.state_file.display()))?,
    );
    let resolver = StaticTagResolver::new(config.tags.iter().map(|(k, v)| (k.clone(), *v)))
        .context("invalid [tags] table")?;
    let sink = open_output(&config.output).await?;
    let cancel = CancellationToken::new();

    let mut loops = Vec::with_capacity(config.sources.len());
    for source_cfg in &config.sources {
        let tag = resolver
            .resolve(&source_cfg.tag)
            .with_context(|| format!("source {:?}: cannot resolve tag", source_cfg.name))?;
        let source = registry.build(source_cfg)?;
        let client = build_client(source_cfg)
            .with_context(|| format!("source {:?}: cannot build http client", source_cfg.name))?;
        loops.push(FetchLoop::new(
            source_cfg.fetch_config(tag),
            source,
            client,
            Arc::clone(&sink),
            Arc::clone(&tracker),
            cancel.clone(),
        ));
    }

    tracing::info!(
        sources = loops.len(),
        state_file = %config.state_file.display(),
        output = %config.output,
        "fetchmux starting"
    );

    let mut tasks = JoinSet::new();
    for fetch in loops {
        let name = fetch.config().object.clone();
        tasks.spawn(async move { (name, fetch.run().await) });
    }
    let flusher = tokio::spawn(flush_loop(
        Arc::clone(&tracker),
        config.flush_interval(),
        cancel.clone(),
    ));

    let mut failures = Vec::new();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            joined = tasks.join_next() => match joined {
                Some(joined) => record_exit(joined, &mut failures),
                None => {
                    tracing::warn!("every fetch loop has stopped, shutting down");
                    break;
                }
            },
        }
    }
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        record_exit(joined, &mut failures);
    }
    let _ = flusher.await;

    tracker
        .flush()
        .await
        .context("final checkpoint flush failed")?;
    tracing::info!("fetchmux stopped");

    if !failures.is_empty() {
        bail!("fetch loops failed: {}", failures.join(", "));
    }
    Ok(())
}

fn record_exit(
    joined: Result<(String, Result<(), FetchError>), tokio::task::JoinError>,
    failures: &mut Vec<String>,
) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((name, Err(e))) => {
            tracing::error!(source = %name, error = %e, "fetch loop stopped, other sources continue");
            failures.push(name);
        }
        Err(e) => {
            tracing::error!(error = %e, "fetch loop task panicked");
            failures.push("<panicked>".to_string());
        }
    }
}

fn build_client(cfg: &SourceConfig) -> anyhow::Result<RetryClient> {
    let transport = ReqwestTransport::new(Duration::from_secs(cfg.request_timeout_secs))?;
    let limiter = Arc::new(RateLimiter::per_minute(cfg.requests_per_minute, cfg.burst));
    let mut builder = RetryClient::builder()
        .transport(Arc::new(transport))
        .rate_limiter(limiter)
        .backoff(Duration::from_secs(cfg.retry_backoff_secs));
    if let Some(codes) = &cfg.recoverable_status {
        builder = builder.recoverable_statuses(codes.iter().copied());
    }
    if let Some(max) = cfg.max_attempts {
        builder = builder.max_attempts(max);
    }
    Ok(builder.build()?)
}

async fn open_output(output: &str) -> anyhow::Result<Arc<dyn IngestSink>> {
    if output == "-" {
        return Ok(Arc::new(NdjsonSink::new(tokio::io::stdout())));
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .await
        .with_context(|| format!("failed to open output {output}"))?;
    Ok(Arc::new(NdjsonSink::new(file)))
}

async fn flush_loop(tracker: Arc<ObjectTracker>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = tracker.flush().await {
                    tracing::warn!(error = %e, "periodic checkpoint flush failed");
                }
            }
        }
    }
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot watch SIGTERM, ctrl-c only");
                let _ = ctrl_c.await;
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received ctrl-c, shutting down");
    }
}
