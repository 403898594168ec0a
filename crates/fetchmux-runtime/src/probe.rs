//! `fetchmux probe`: exercise one sub-protocol channel end to end.

use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use fetchmux_router::{Router, timeout_from_millis};

use crate::cli::ProbeOpts;

pub async fn cmd_probe(opts: ProbeOpts) -> anyhow::Result<()> {
    let timeout = timeout_from_millis(opts.timeout_ms)?;
    let message = opts
        .message
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("--message is not valid JSON")?;
    let reply = probe(&opts.url, &opts.protocol, timeout, message.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

/// Negotiate `protocol`, optionally send `message`, and return the first reply.
pub async fn probe(
    url: &str,
    protocol: &str,
    timeout: Option<Duration>,
    message: Option<&Value>,
) -> anyhow::Result<Value> {
    let router = Router::connect(url, [protocol])
        .await
        .with_context(|| format!("failed to negotiate {protocol:?} with {url}"))?;
    let mut conn = router.open_channel(protocol).await?;
    conn.set_timeout(timeout);
    router.start().await?;

    if let Some(message) = message {
        conn.write_json(message).await.context("failed to send message")?;
        tracing::debug!(subproto = protocol, "probe message sent");
    }
    let reply = conn.read_json::<Value>().await.context("no reply");

    if let Err(e) = router.close().await {
        tracing::debug!(error = %e, "probe: router already closed");
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one client and echoes every `echo` frame back with `seen: true`.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let Ok(router) = Router::accept(ws, ["echo", "stats"]).await else {
                return;
            };
            let mut echo = router.open_channel("echo").await.unwrap();
            router.start().await.unwrap();
            while let Ok(mut v) = echo.read_json::<Value>().await {
                v["seen"] = Value::Bool(true);
                if echo.write_json(&v).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn probe_round_trips_one_message() {
        let url = echo_server().await;
        let msg = serde_json::json!({"hello": "world"});
        let reply = probe(&url, "echo", Some(Duration::from_secs(5)), Some(&msg))
            .await
            .unwrap();
        assert_eq!(reply["hello"], "world");
        assert_eq!(reply["seen"], true);
    }

    #[tokio::test]
    async fn probe_without_reply_times_out() {
        let url = echo_server().await;
        let err = probe(&url, "echo", Some(Duration::from_millis(200)), None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("no reply"), "{err:#}");
    }

    #[tokio::test]
    async fn unsupported_protocol_fails_negotiation() {
        let url = echo_server().await;
        let err = probe(&url, "metrics", Some(Duration::from_secs(1)), None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("metrics"), "{err:#}");
    }
}
