//! OKX connector for the candela gateway.
//!
//! Covers the spot, USDT-margined perpetual (`swap`) and coin-margined
//! perpetual (`swap_coinm`) contract families. All families stream over the
//! shared business endpoint; the contract family is carried by the
//! per-symbol subscription arguments, not the URL.

mod decoder;
mod rest;

use std::collections::HashMap;
use std::sync::Arc;

use candela_core::{GatewayError, RestPool, VenueConnector, VenueDecoder, VenueEndpoint};

pub use decoder::OkxDecoder;
pub use rest::OkxRest;

/// Venue name as it appears in subscriptions and quotes.
pub const VENUE: &str = "okx";

const DEFAULT_FAMILY: &str = "spot";

fn endpoints() -> HashMap<&'static str, VenueEndpoint> {
    let business = |cap: usize| VenueEndpoint {
        stream_url: "wss://ws.okx.com:8443/ws/v5/business".to_string(),
        rest_url: "https://www.okx.com/api/v5/market/candles".to_string(),
        default_interval: "1m".to_string(),
        max_symbols_per_session: cap,
    };
    HashMap::from([
        ("spot", business(200)),
        ("swap", business(200)),
        ("swap_coinm", business(200)),
    ])
}

/// OKX venue registration: family aliasing and decoder construction.
pub struct OkxConnector {
    endpoints: HashMap<&'static str, VenueEndpoint>,
    rest: Arc<RestPool>,
}

impl OkxConnector {
    /// Create the connector, sharing the gateway's pooled REST clients.
    #[must_use]
    pub fn new(rest: Arc<RestPool>) -> Self {
        Self {
            endpoints: endpoints(),
            rest,
        }
    }
}

impl VenueConnector for OkxConnector {
    fn name(&self) -> &'static str {
        VENUE
    }

    fn resolve_family(&self, requested: Option<&str>) -> Result<String, GatewayError> {
        let family = match requested {
            None => DEFAULT_FAMILY.to_string(),
            Some(raw) => {
                // Router keys use okx's own family tokens; accept the wire
                // instType casing and the cross-venue margin names.
                let lowered = raw.to_ascii_lowercase();
                match lowered.as_str() {
                    "usdm" => "swap".to_string(),
                    "coinm" | "swap-coinm" => "swap_coinm".to_string(),
                    _ => lowered,
                }
            }
        };
        if self.endpoints.contains_key(family.as_str()) {
            Ok(family)
        } else {
            Err(GatewayError::UnsupportedContractType(format!(
                "unsupported okx contract type: {}",
                requested.unwrap_or_default()
            )))
        }
    }

    fn endpoint(&self, family: &str) -> Option<&VenueEndpoint> {
        self.endpoints.get(family)
    }

    fn decoder(&self, family: &str) -> Result<Arc<dyn VenueDecoder>, GatewayError> {
        let endpoint = self.endpoint(family).ok_or_else(|| {
            GatewayError::UnsupportedContractType(format!("unsupported okx contract type: {family}"))
        })?;
        let rest = OkxRest::new(
            self.rest.client(VENUE)?,
            endpoint.rest_url.clone(),
            endpoint.default_interval.clone(),
            family.to_string(),
            self.rest.max_inflight(),
        );
        Ok(Arc::new(OkxDecoder::new(
            endpoint.stream_url.clone(),
            endpoint.default_interval.clone(),
            family.to_string(),
            rest,
        )))
    }
}
