//! Candela re-exposes venue candle streams through one uniform endpoint.
//!
//! Overview
//! - Maintains one supervised upstream WebSocket session per symbol batch:
//!   connect → subscribe → receive → idle-detect → backfill → reconnect,
//!   with a circuit breaker gating reconnect attempts.
//! - Deduplicates quotes across reconnection and backfill seams on
//!   `(symbol, event-time-ms)`.
//! - Shares upstream sessions across local subscribers: the router keys
//!   sessions by `(venue, contract family, sorted symbol batch)` and caps
//!   upstream concurrency per venue.
//! - Fans quotes out through bounded per-subscriber mailboxes; a slow
//!   subscriber is detached with a backpressure error instead of stalling
//!   the pump.
//! - Serves local clients over WebSocket with a stable error taxonomy.
//!
//! Key behaviors and trade-offs
//! - Idle-then-backfill-then-reconnect bounds staleness even when a venue
//!   keeps a silent socket open, the dominant real-world failure mode.
//! - Final candles are never dropped (bounded FIFO with backpressure);
//!   provisional updates may be shed oldest-first because newer updates for
//!   the same bar supersede them.
//! - Transient transport failures are retried and never surface to
//!   subscribers; subscribe-time rejections are fatal and classified onto
//!   wire error codes.
#![warn(missing_docs)]

pub mod engine;
mod router;
pub mod server;
pub mod shutdown;

pub use router::{Router, RouterBuilder, Subscription};
