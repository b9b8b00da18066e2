use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;

use candela_core::{GatewayError, Quote};

use crate::VENUE;

/// REST backfill client for OKX market candles.
///
/// Best-effort: per-symbol failures are logged and skipped.
pub struct OkxRest {
    client: reqwest::Client,
    base_url: String,
    interval: String,
    contract_family: String,
    max_inflight: usize,
}

impl OkxRest {
    /// Build a backfill client against the market-candles endpoint.
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

    /// Fetch the latest candle for each instrument.
    ///
    /// # Errors
    /// Currently never fails as a whole; per-symbol failures are logged and
    /// omitted from the result.
    pub async fn latest_candles(
        &self,
        symbols: &[String],
        family: &str,
    ) -> Result<Vec<Quote>, GatewayError> {
        let mut fetches: Vec<
            std::pin::Pin<
                Box<dyn std::future::Future<Output = (String, Result<Option<Quote>, GatewayError>)> + Send + '_>,
            >,
        > = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            fetches.push(Box::pin(async move {
                (symbol.clone(), self.fetch_one(symbol, family).await)
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
                        "okx backfill request failed"
                    );
                }
            }
        }
        Ok(candles)
    }

    async fn fetch_one(&self, symbol: &str, family: &str) -> Result<Option<Quote>, GatewayError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("instId", symbol),
                ("bar", self.interval.as_str()),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::BackfillFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| GatewayError::BackfillFailed(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::BackfillFailed(e.to_string()))?;
        if body.get("code").and_then(Value::as_str).unwrap_or("0") != "0" {
            return Err(GatewayError::BackfillFailed(format!(
                "okx error response: {body}"
            )));
        }
        let Some(row) = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_array)
        else {
            return Ok(None);
        };
        Ok(self.parse_row(symbol, family, row))
    }

    // Rows mirror the stream shape: [ts, o, h, l, c, vol, ..., confirm].
    fn parse_row(&self, symbol: &str, family: &str, row: &[Value]) -> Option<Quote> {
        if row.len() < 6 {
            return None;
        }
        let ts_ms = num(&row[0])? as i64;
        let event_time = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
        let is_final = row
            .get(8)
            .and_then(Value::as_str)
            .is_none_or(|confirm| confirm == "1");
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
