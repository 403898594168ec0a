//! fetchmux-router: sub-protocol multiplexing over a single WebSocket.
//!
//! Each frame is `{"type": "<subproto>", "data": <json>}`. The router
//! negotiates the sub-protocol list once, routes inbound frames into one
//! FIFO queue per name, and serializes outbound frames from every channel
//! behind a single write lock.

pub mod channel;
pub mod error;
pub mod frame;
pub mod router;

pub use channel::{SubProtoConn, timeout_from_millis};
pub use error::RouterError;
pub use frame::Negotiation;
pub use router::Router;
