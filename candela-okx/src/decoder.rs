use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use candela_core::{ConnectArgs, GatewayError, Quote, VenueDecoder, WsSink};

use crate::VENUE;
use crate::rest::OkxRest;

/// Decoder for the OKX candle channel.
pub struct OkxDecoder {
    stream_url: String,
    interval: String,
    contract_family: String,
    rest: OkxRest,
}

impl OkxDecoder {
    /// Build a decoder for one contract family.
    #[must_use]
    pub fn new(
        stream_url: String,
        interval: String,
        contract_family: String,
        rest: OkxRest,
    ) -> Self {
        Self {
            stream_url,
            interval,
            contract_family,
            rest,
        }
    }

    /// Subscription frame for the session's symbol batch.
    #[must_use]
    pub fn subscribe_frame(&self, symbols: &[String]) -> String {
        let args: Vec<Value> = symbols
            .iter()
            .map(|symbol| {
                json!({
                    "channel": format!("candle{}", self.interval),
                    "instId": symbol,
                })
            })
            .collect();
        json!({ "op": "subscribe", "args": args }).to_string()
    }

    /// Decode one channel payload into zero or more quotes.
    ///
    /// Subscription acks, error events, and pong frames decode to nothing.
    #[must_use]
    pub fn parse_frame(&self, text: &str) -> Vec<Quote> {
        if text == "pong" {
            return Vec::new();
        }
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            tracing::debug!(venue = VENUE, "discarding non-json frame");
            return Vec::new();
        };
        if let Some(event) = message.get("event").and_then(Value::as_str) {
            if event == "error" {
                tracing::warn!(
                    venue = VENUE,
                    message = %message,
                    "okx channel error event"
                );
            }
            return Vec::new();
        }

        let arg = message.get("arg").cloned().unwrap_or_default();
        let symbol = arg
            .get("instId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // The wire instType is case-normalized into the quote; router keys
        // use the canonical family regardless.
        let family = arg
            .get("instType")
            .and_then(Value::as_str)
            .map_or_else(|| self.contract_family.clone(), str::to_ascii_lowercase);

        let Some(rows) = message.get("data").and_then(Value::as_array) else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| self.row_to_quote(row, &symbol, &family))
            .collect()
    }

    // Candle rows are positional: [ts, o, h, l, c, vol, ...] with the
    // confirm flag at index 8 (older payloads: index 7).
    fn row_to_quote(&self, row: &Value, symbol: &str, family: &str) -> Option<Quote> {
        let row = row.as_array()?;
        if row.len() < 6 {
            return None;
        }
        let ts_ms = num(&row[0])? as i64;
        let event_time = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
        let confirm = row.get(8).or_else(|| row.get(7));
        let is_final = confirm
            .map(|v| match v {
                Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "t"),
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64() == Some(1),
                _ => false,
            })
            .unwrap_or(false);

        Some(Quote {
            venue: VENUE.to_string(),
            symbol: symbol.to_string(),
            contract_family: family.to_string(),
            event_time,
            open: num(&row[1])?,
            high: num(&row[2])?,
            low: num(&row[3])?,
            close: num(&row[4])?,
            volume: num(&row[5]).unwrap_or(0.0),
            trade_count: 0,
            is_final,
        })
    }
}

fn num(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_f64(),
    }
}

#[async_trait]
impl VenueDecoder for OkxDecoder {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn connect_args(&self, _symbols: &[String]) -> Result<ConnectArgs, GatewayError> {
        Ok(ConnectArgs::url(self.stream_url.clone()))
    }

    async fn on_connected(
        &self,
        sink: &mut WsSink,
        symbols: &[String],
    ) -> Result<(), GatewayError> {
        let frame = self.subscribe_frame(symbols);
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| GatewayError::connect_failed(format!("okx subscribe send: {e}")))?;
        tracing::info!(
            venue = VENUE,
            contract_family = %self.contract_family,
            symbols = symbols.len(),
            "subscribed to okx candle channel"
        );
        Ok(())
    }

    async fn process_frame(
        &self,
        text: &str,
        _sink: &mut WsSink,
    ) -> Result<Vec<Quote>, GatewayError> {
        Ok(self.parse_frame(text))
    }

    async fn backfill(&self, symbols: &[String]) -> Result<Vec<Quote>, GatewayError> {
        self.rest
            .latest_candles(symbols, &self.contract_family)
            .await
    }
}
