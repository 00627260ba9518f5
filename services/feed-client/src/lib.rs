//! Streaming venue feed client
//!
//! Keeps one WebSocket to the venue alive and multiplexes over it: server
//! time sync, per-symbol ticks folded into minute bars, per-symbol payout
//! proposals, and one-shot historical candle queries. Consumers poll
//! snapshots or subscribe to the live price fan-out from any task.
//!
//! # Tasks
//! - connection loop: connect, forward frames as events, reconnect every 5 s
//! - router: parse and classify replies, apply them, replay failed requests
//! - sender: drain the outbound queue, rate-limit backoff, keepalive pings

pub mod candles;
pub mod client;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod router;
mod sender;
pub mod subscriptions;
pub mod time_sync;
pub mod transport;

pub use client::FeedClient;
pub use config::{AppConfig, ClientConfig};
pub use connection::ConnectionState;
pub use protocol::{ProposalParams, Request};
pub use subscriptions::{ProposalSnapshot, QuoteSnapshot};
pub use time_sync::ServerTime;
pub use transport::{MemorySession, MemoryTransport, Transport, WebSocketTransport};
