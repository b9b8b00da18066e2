use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized OHLCV observation for one symbol at one instant.
///
/// Produced by a streaming session (either from a live frame or a REST
/// backfill row), deduplicated, and fanned out to local subscribers.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    /// Venue that produced the observation (e.g. `"binance"`).
    pub venue: String,
    /// Venue-native symbol (e.g. `"BTCUSDT"`).
    pub symbol: String,
    /// Contract family the symbol trades under (e.g. `"spot"`, `"usdm"`).
    pub contract_family: String,
    /// Candle event time, UTC with millisecond precision.
    pub event_time: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close (or latest) price.
    pub close: f64,
    /// Base-asset volume.
    pub volume: f64,
    /// Number of trades inside the candle, when the venue reports it.
    pub trade_count: u64,
    /// `true` once the candle's interval has elapsed and no further updates
    /// will follow for it.
    pub is_final: bool,
}

impl Quote {
    /// Deduplication key: `(symbol, event time in epoch milliseconds)`.
    ///
    /// The venue is implicit — one deduplicator exists per upstream session.
    #[must_use]
    pub fn dedup_key(&self) -> (String, i64) {
        (self.symbol.clone(), self.event_time.timestamp_millis())
    }

    /// Convert the quote into the downstream candle event.
    ///
    /// `event_time` is the emission instant stamped into `E`; `interval` is
    /// the venue's interval label (e.g. `"1m"`). Both candle timestamps carry
    /// the quote's event time, matching the upstream kline convention where
    /// backfilled and streamed candles are keyed by their close time.
    #[must_use]
    pub fn to_candle_event(&self, event_time: DateTime<Utc>, interval: &str) -> CandleEvent {
        let candle_ms = self.event_time.timestamp_millis();
        CandleEvent {
            event: "candle".to_string(),
            event_time_ms: event_time.timestamp_millis(),
            symbol: self.symbol.clone(),
            candle: CandlePayload {
                open_time_ms: candle_ms,
                close_time_ms: candle_ms,
                symbol: self.symbol.clone(),
                interval: interval.to_string(),
                open: self.open,
                close: self.close,
                high: self.high,
                low: self.low,
                volume: self.volume,
                is_final: self.is_final,
            },
        }
    }
}

/// Candle body of a downstream event, using the compact kline field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandlePayload {
    /// Candle open time, epoch milliseconds.
    #[serde(rename = "t")]
    pub open_time_ms: i64,
    /// Candle close time, epoch milliseconds.
    #[serde(rename = "T")]
    pub close_time_ms: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Interval label, e.g. `"1m"`.
    #[serde(rename = "i")]
    pub interval: String,
    /// Open price.
    #[serde(rename = "o")]
    pub open: f64,
    /// Close price.
    #[serde(rename = "c")]
    pub close: f64,
    /// High price.
    #[serde(rename = "h")]
    pub high: f64,
    /// Low price.
    #[serde(rename = "l")]
    pub low: f64,
    /// Volume.
    #[serde(rename = "v")]
    pub volume: f64,
    /// Whether the candle is closed.
    #[serde(rename = "x")]
    pub is_final: bool,
}

/// Downstream candle event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleEvent {
    /// Event type tag, always `"candle"`.
    #[serde(rename = "e")]
    pub event: String,
    /// Emission timestamp, epoch milliseconds.
    #[serde(rename = "E")]
    pub event_time_ms: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Candle body.
    #[serde(rename = "k")]
    pub candle: CandlePayload,
}
