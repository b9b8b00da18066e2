//! Core building blocks for the candela market-data gateway.
//!
//! Overview
//! - Defines the normalized [`Quote`] record and its downstream wire events.
//! - Defines the [`VenueDecoder`] / [`VenueConnector`] contracts implemented
//!   by per-venue connector crates.
//! - Provides the shared streaming primitives: circuit breaker, quote
//!   deduplicator, dual-priority queue, stream handles, and the pooled REST
//!   client directory.
//! - Normalizes error handling into [`GatewayError`] with stable wire-level
//!   [`ErrorCode`]s.
#![warn(missing_docs)]

mod breaker;
mod decoder;
mod dedup;
mod error;
mod queue;
mod quote;
mod rest;
mod settings;
pub mod stream;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use decoder::{ConnectArgs, VenueConnector, VenueDecoder, VenueEndpoint, WsSink};
pub use dedup::QuoteDeduplicator;
pub use error::{ErrorCode, ErrorEvent, GatewayError};
pub use queue::DualQueue;
pub use quote::{CandleEvent, CandlePayload, Quote};
pub use rest::RestPool;
pub use settings::{ConnectorSettings, ServerSettings, Settings};
pub use stream::StreamHandle;
