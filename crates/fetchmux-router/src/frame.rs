//! Wire shapes carried in WebSocket text frames.
//!
//! Negotiation (first frame in each direction): `{"Subs": ["ping", "stats"]}`.
//! Data: `{"type": "<subproto>", "data": <json>}`.

use serde::{Deserialize, Serialize};

/// Sub-protocol list exchanged once at connection setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    #[serde(rename = "Subs")]
    pub subs: Vec<String>,
}

/// Inbound data frame with its payload still undecoded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub subproto: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Outbound data frame borrowing its payload.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a, T: Serialize + ?Sized> {
    #[serde(rename = "type")]
    pub subproto: &'a str,
    pub data: &'a T,
}

/// Drop duplicate and empty names, keeping first-seen order.
pub fn dedup_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let name = name.as_ref();
        if !name.is_empty() && !out.iter().any(|n| n == name) {
            out.push(name.to_owned());
        }
    }
    out
}
