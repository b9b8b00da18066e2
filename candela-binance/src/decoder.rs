use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use candela_core::{ConnectArgs, GatewayError, Quote, VenueDecoder, WsSink};

use crate::rest::BinanceRest;
use crate::VENUE;

/// Decoder for Binance combined kline streams.
pub struct BinanceDecoder {
    stream_url: String,
    interval: String,
    contract_family: String,
    rest: BinanceRest,
}

impl BinanceDecoder {
    /// Build a decoder for one contract family's stream endpoint.
    #[must_use]
    pub fn new(
        stream_url: String,
        interval: String,
        contract_family: String,
        rest: BinanceRest,
    ) -> Self {
        Self {
            stream_url,
            interval,
            contract_family,
            rest,
        }
    }

    /// Combined-stream URL for the session's symbol batch.
    #[must_use]
    pub fn stream_url(&self, symbols: &[String]) -> String {
        let streams = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_ascii_lowercase(), self.interval))
            .collect::<Vec<_>>()
            .join("/");
        let base = self.stream_url.strip_suffix("/ws").unwrap_or(&self.stream_url);
        format!("{base}/stream?streams={streams}")
    }

    /// Decode one combined-stream payload into at most one quote.
    ///
    /// Acks, subscription responses, and malformed klines decode to nothing.
    #[must_use]
    pub fn parse_frame(&self, text: &str) -> Vec<Quote> {
        let Ok(payload) = serde_json::from_str::<Value>(text) else {
            tracing::debug!(venue = VENUE, "discarding non-json frame");
            return Vec::new();
        };
        // Combined streams wrap the event under "data".
        let data = payload.get("data").unwrap_or(&payload);
        let Some(kline) = data.get("k") else {
            return Vec::new();
        };

        let symbol = kline
            .get("s")
            .or_else(|| data.get("s"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (Some(open), Some(high), Some(low), Some(close)) = (
            num(kline.get("o")),
            num(kline.get("h")),
            num(kline.get("l")),
            num(kline.get("c")),
        ) else {
            tracing::debug!(venue = VENUE, %symbol, "discarding kline with missing fields");
            return Vec::new();
        };
        let volume = num(kline.get("v")).unwrap_or(0.0);
        let trade_count = kline.get("n").and_then(Value::as_u64).unwrap_or(0);

        let event_time_ms = data
            .get("E")
            .and_then(Value::as_i64)
            .or_else(|| kline.get("T").and_then(Value::as_i64));
        let event_time = event_time_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        vec![Quote {
            venue: VENUE.to_string(),
            symbol,
            contract_family: self.contract_family.clone(),
            event_time,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            is_final: kline.get("x").and_then(Value::as_bool).unwrap_or(false),
        }]
    }
}

// Binance serializes prices as JSON strings; be liberal about numbers too.
fn num(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        other => other.as_f64(),
    }
}

#[async_trait]
impl VenueDecoder for BinanceDecoder {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect_args(&self, symbols: &[String]) -> Result<ConnectArgs, GatewayError> {
        Ok(ConnectArgs::url(self.stream_url(symbols)))
    }

    async fn process_frame(
        &self,
        text: &str,
        _sink: &mut WsSink,
    ) -> Result<Vec<Quote>, GatewayError> {
        // The subscription is encoded in the URL; no frames need replies.
        Ok(self.parse_frame(text))
    }

    async fn backfill(&self, symbols: &[String]) -> Result<Vec<Quote>, GatewayError> {
        self.rest.latest_candles(symbols).await
    }
}
