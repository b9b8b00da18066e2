use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;

use candela_core::{GatewayError, Quote};

use crate::VENUE;

/// REST backfill client for Binance klines.
///
/// Fetches the most recent candle per symbol, bounding in-flight requests by
/// the pool's configured maximum. Individual request failures are logged and
/// skipped; backfill is best-effort by contract.
pub struct BinanceRest {
    client: reqwest::Client,
    base_url: String,
    interval: String,
    contract_family: String,
    max_inflight: usize,
}

impl BinanceRest {
    /// Build a backfill client for one contract family's klines endpoint.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        interval: String,
        contract_family: String,
        max_inflight: usize,
    ) -> Self {
        Self {
            client,
            base_url,
            interval,
            contract_family,
            max_inflight,
        }
    }

    /// Fetch the latest candle for each symbol.
    ///
    /// # Errors
    /// Currently never fails as a whole; per-symbol failures are logged and
    /// omitted from the result.
    pub async fn latest_candles(&self, symbols: &[String]) -> Result<Vec<Quote>, GatewayError> {
        let mut fetches: Vec<
            std::pin::Pin<
                Box<dyn std::future::Future<Output = (String, Result<Option<Quote>, GatewayError>)> + Send + '_>,
            >,
        > = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            fetches.push(Box::pin(async move {
                (symbol.clone(), self.fetch_one(symbol).await)
            }));
        }
        let results: Vec<(String, Result<Option<Quote>, GatewayError>)> =
            futures_util::stream::iter(fetches)
                .buffer_unordered(self.max_inflight)
                .collect()
                .await;

        let mut candles = Vec::new();
        for (symbol, result) in results {
            match result {
                Ok(Some(quote)) => candles.push(quote),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        venue = VENUE,
                        %symbol,
                        contract_family = %self.contract_family,
                        error = %e,
                        "binance backfill request failed"
                    );
                }
            }
        }
        Ok(candles)
    }

    async fn fetch_one(&self, symbol: &str) -> Result<Option<Quote>, GatewayError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("symbol", symbol),
                ("interval", self.interval.as_str()),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::BackfillFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| GatewayError::BackfillFailed(e.to_string()))?;

        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| GatewayError::BackfillFailed(e.to_string()))?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(self.parse_row(symbol, row))
    }

    // Kline rows are positional:
    // [openTime, o, h, l, c, v, closeTime, quoteVol, trades, ...]
    fn parse_row(&self, symbol: &str, row: &[Value]) -> Option<Quote> {
        if row.len() < 7 {
            return None;
        }
        let close_time = row[6].as_i64()?;
        let event_time = DateTime::<Utc>::from_timestamp_millis(close_time)?;
        Some(Quote {
            venue: VENUE.to_string(),
            symbol: symbol.to_string(),
            contract_family: self.contract_family.clone(),
            event_time,
            open: num(&row[1])?,
            high: num(&row[2])?,
            low: num(&row[3])?,
            close: num(&row[4])?,
            volume: num(&row[5]).unwrap_or(0.0),
            trade_count: row.get(8).and_then(Value::as_u64).unwrap_or(0),
            is_final: true,
        })
    }
}

fn num(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_f64(),
    }
}
