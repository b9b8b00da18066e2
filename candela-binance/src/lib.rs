//! Binance connector for the candela gateway.
//!
//! Covers the spot, USDT-margined (`usdm`) and coin-margined (`coinm`)
//! contract families. Streaming uses the combined kline stream endpoint;
//! backfill reads the venue's klines REST endpoint, one request per symbol.

mod decoder;
mod rest;

use std::collections::HashMap;
use std::sync::Arc;

use candela_core::{GatewayError, RestPool, VenueConnector, VenueDecoder, VenueEndpoint};

pub use decoder::BinanceDecoder;
pub use rest::BinanceRest;

/// Venue name as it appears in subscriptions and quotes.
pub const VENUE: &str = "binance";

fn endpoints() -> HashMap<&'static str, VenueEndpoint> {
    HashMap::from([
        (
            "spot",
            VenueEndpoint {
                stream_url: "wss://stream.binance.com:9443/ws".to_string(),
                rest_url: "https://api.binance.com/api/v3/klines".to_string(),
                default_interval: "1m".to_string(),
                max_symbols_per_session: 200,
            },
        ),
        (
            "usdm",
            VenueEndpoint {
                stream_url: "wss://fstream.binance.com/ws".to_string(),
                rest_url: "https://fapi.binance.com/fapi/v1/klines".to_string(),
                default_interval: "1m".to_string(),
                max_symbols_per_session: 200,
            },
        ),
        (
            "coinm",
            VenueEndpoint {
                stream_url: "wss://dstream.binance.com/ws".to_string(),
                rest_url: "https://dapi.binance.com/dapi/v1/klines".to_string(),
                default_interval: "1m".to_string(),
                max_symbols_per_session: 200,
            },
        ),
    ])
}

/// Binance venue registration: family resolution and decoder construction.
pub struct BinanceConnector {
    endpoints: HashMap<&'static str, VenueEndpoint>,
    rest: Arc<RestPool>,
}

impl BinanceConnector {
    /// Create the connector, sharing the gateway's pooled REST clients.
    #[must_use]
    pub fn new(rest: Arc<RestPool>) -> Self {
        Self {
            endpoints: endpoints(),
            rest,
        }
    }
}

impl VenueConnector for BinanceConnector {
    fn name(&self) -> &'static str {
        VENUE
    }

    fn resolve_family(&self, requested: Option<&str>) -> Result<String, GatewayError> {
        // Binance endpoints differ per family; there is no safe default.
        let Some(requested) = requested else {
            return Err(GatewayError::UnsupportedContractType(
                "binance requires a contract type".to_string(),
            ));
        };
        let family = requested.to_ascii_lowercase();
        if self.endpoints.contains_key(family.as_str()) {
            Ok(family)
        } else {
            Err(GatewayError::UnsupportedContractType(format!(
                "unsupported binance contract type: {requested}"
            )))
        }
    }

    fn endpoint(&self, family: &str) -> Option<&VenueEndpoint> {
        self.endpoints.get(family)
    }

    fn decoder(&self, family: &str) -> Result<Arc<dyn VenueDecoder>, GatewayError> {
        let endpoint = self.endpoint(family).ok_or_else(|| {
            GatewayError::UnsupportedContractType(format!(
                "unsupported binance contract type: {family}"
            ))
        })?;
        let rest = BinanceRest::new(
            self.rest.client(VENUE)?,
            endpoint.rest_url.clone(),
            endpoint.default_interval.clone(),
            family.to_string(),
            self.rest.max_inflight(),
        );
        Ok(Arc::new(BinanceDecoder::new(
            endpoint.stream_url.clone(),
            endpoint.default_interval.clone(),
            family.to_string(),
            rest,
        )))
    }
}
