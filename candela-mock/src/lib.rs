//! Scriptable mock venue for gateway tests.
//!
//! The mock venue speaks a trivial JSON wire format (a flat rendition of the
//! internal quote record) and exposes knobs for the behaviors integration
//! tests need to provoke: subscribe rejection, scripted backfill, and
//! arbitrary stream endpoints (usually an in-process fixture server).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use candela_core::{
    ConnectArgs, GatewayError, Quote, VenueConnector, VenueDecoder, VenueEndpoint, WsSink,
};

/// Venue name used by the mock connector.
pub const VENUE: &str = "mock";

/// Wire shape of a mock frame; one frame decodes to one quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockFrame {
    /// Symbol.
    pub symbol: String,
    /// Event time, epoch milliseconds.
    pub ts: i64,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Volume.
    pub volume: f64,
    /// Closed-candle flag.
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Build a quote the way the mock venue emits them.
#[must_use]
pub fn quote(symbol: &str, ts_ms: i64, is_final: bool) -> Quote {
    Quote {
        venue: VENUE.to_string(),
        symbol: symbol.to_string(),
        contract_family: "spot".to_string(),
        event_time: DateTime::<Utc>::from_timestamp_millis(ts_ms).expect("valid test timestamp"),
        open: 1.0,
        high: 2.0,
        low: 0.5,
        close: 1.5,
        volume: 100.0,
        trade_count: 0,
        is_final,
    }
}

/// Serialize a quote into the mock wire format, for fixture servers.
#[must_use]
pub fn frame_for(q: &Quote) -> String {
    serde_json::to_string(&MockFrame {
        symbol: q.symbol.clone(),
        ts: q.event_time.timestamp_millis(),
        open: q.open,
        high: q.high,
        low: q.low,
        close: q.close,
        volume: q.volume,
        is_final: q.is_final,
    })
    .expect("mock frame serializes")
}

#[derive(Debug, Clone, Default)]
struct Behavior {
    reject_subscribe: Option<(String, Option<String>)>,
    backfill: Vec<Quote>,
}

/// Mock venue connector with one `spot` contract family.
pub struct MockVenue {
    endpoints: HashMap<&'static str, VenueEndpoint>,
    behavior: Behavior,
}

impl MockVenue {
    /// Create a mock venue streaming from `stream_url`.
    #[must_use]
    pub fn new(stream_url: impl Into<String>) -> Self {
        let endpoint = VenueEndpoint {
            stream_url: stream_url.into(),
            rest_url: String::new(),
            default_interval: "1m".to_string(),
            max_symbols_per_session: 50,
        };
        Self {
            endpoints: HashMap::from([("spot", endpoint)]),
            behavior: Behavior::default(),
        }
    }

    /// Cap symbols per session (to exercise batching).
    #[must_use]
    pub fn with_session_cap(mut self, cap: usize) -> Self {
        if let Some(e) = self.endpoints.get_mut("spot") {
            e.max_symbols_per_session = cap;
        }
        self
    }

    /// Make every subscribe attempt fail fatally with the given messages.
    #[must_use]
    pub fn rejecting(
        mut self,
        message: impl Into<String>,
        exchange_message: Option<String>,
    ) -> Self {
        self.behavior.reject_subscribe = Some((message.into(), exchange_message));
        self
    }

    /// Script the quotes returned by idle-time backfill.
    #[must_use]
    pub fn with_backfill(mut self, quotes: Vec<Quote>) -> Self {
        self.behavior.backfill = quotes;
        self
    }
}

impl VenueConnector for MockVenue {
    fn name(&self) -> &'static str {
        VENUE
    }

    fn resolve_family(&self, requested: Option<&str>) -> Result<String, GatewayError> {
        let family = requested.unwrap_or("spot").to_ascii_lowercase();
        if self.endpoints.contains_key(family.as_str()) {
            Ok(family)
        } else {
            Err(GatewayError::UnsupportedContractType(format!(
                "unsupported mock contract type: {family}"
            )))
        }
    }

    fn endpoint(&self, family: &str) -> Option<&VenueEndpoint> {
        self.endpoints.get(family)
    }

    fn decoder(&self, family: &str) -> Result<Arc<dyn VenueDecoder>, GatewayError> {
        let endpoint = self.endpoint(family).ok_or_else(|| {
            GatewayError::UnsupportedContractType(format!(
                "unsupported mock contract type: {family}"
            ))
        })?;
        Ok(Arc::new(MockDecoder {
            stream_url: endpoint.stream_url.clone(),
            behavior: self.behavior.clone(),
        }))
    }
}

/// Decoder for the mock wire format.
pub struct MockDecoder {
    stream_url: String,
    behavior: Behavior,
}

#[async_trait]
impl VenueDecoder for MockDecoder {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect_args(&self, _symbols: &[String]) -> Result<ConnectArgs, GatewayError> {
        Ok(ConnectArgs::url(self.stream_url.clone()))
    }

    async fn on_connected(
        &self,
        _sink: &mut WsSink,
        _symbols: &[String],
    ) -> Result<(), GatewayError> {
        match &self.behavior.reject_subscribe {
            Some((message, exchange_message)) => Err(GatewayError::subscribe_rejected(
                message.clone(),
                exchange_message.clone(),
            )),
            None => Ok(()),
        }
    }

    async fn process_frame(
        &self,
        text: &str,
        _sink: &mut WsSink,
    ) -> Result<Vec<Quote>, GatewayError> {
        let Ok(frame) = serde_json::from_str::<MockFrame>(text) else {
            return Ok(Vec::new());
        };
        let Some(event_time) = DateTime::<Utc>::from_timestamp_millis(frame.ts) else {
            return Ok(Vec::new());
        };
        Ok(vec![Quote {
            venue: VENUE.to_string(),
            symbol: frame.symbol,
            contract_family: "spot".to_string(),
            event_time,
            open: frame.open,
            high: frame.high,
            low: frame.low,
            close: frame.close,
            volume: frame.volume,
            trade_count: 0,
            is_final: frame.is_final,
        }])
    }

    async fn backfill(&self, _symbols: &[String]) -> Result<Vec<Quote>, GatewayError> {
        Ok(self.behavior.backfill.clone())
    }
}
