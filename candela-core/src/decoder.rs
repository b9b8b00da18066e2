//! Contracts implemented by per-venue connector crates.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{GatewayError, Quote};

/// Write half of an upstream venue socket, as seen by a decoder.
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Wire target for one venue × contract family.
#[derive(Debug, Clone)]
pub struct VenueEndpoint {
    /// Base WebSocket URL for the streaming session.
    pub stream_url: String,
    /// Base REST URL used for backfill snapshots.
    pub rest_url: String,
    /// Interval label the venue streams at (e.g. `"1m"`).
    pub default_interval: String,
    /// Upper bound on symbols multiplexed over one session.
    pub max_symbols_per_session: usize,
}

/// Arguments for opening an upstream session.
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    /// Fully-formed connection URL.
    pub url: String,
    /// Extra request headers, when the venue needs them.
    pub headers: Vec<(String, String)>,
}

impl ConnectArgs {
    /// Connect args with a URL and no extra headers.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }
}

/// Payload decoder for one venue × contract family.
///
/// Implementations are thin: they know how to form the connection URL, send
/// subscribe frames, turn inbound frames into zero-or-more [`Quote`]s, and
/// fetch a REST snapshot when the stream goes quiet. All session mechanics
/// (reconnects, breaker, dedup, idle detection) live in the streaming engine.
#[async_trait]
pub trait VenueDecoder: Send + Sync {
    /// Venue name in its canonical lowercase form (e.g. `"binance"`).
    fn venue(&self) -> &'static str;

    /// Build the connection arguments for a session over `symbols`.
    ///
    /// # Errors
    /// `SubscribeRejected` when the symbol set cannot be expressed as a
    /// session (bad symbol, unsupported combination).
    fn connect_args(&self, symbols: &[String]) -> Result<ConnectArgs, GatewayError>;

    /// Run after the socket is established; send subscribe frames here.
    ///
    /// # Errors
    /// `SubscribeRejected` when the venue refuses the subscription. This is
    /// fatal for the session group and is never retried.
    async fn on_connected(&self, sink: &mut WsSink, symbols: &[String]) -> Result<(), GatewayError> {
        let _ = (sink, symbols);
        Ok(())
    }

    /// Decode a text frame into zero or more quotes.
    ///
    /// Acks, pings, and unknown topics decode to an empty vector. Protocol
    /// keepalive replies (e.g. a venue-level pong) must be written to `sink`
    /// before returning so they precede any yielded quote.
    ///
    /// # Errors
    /// `SubscribeRejected` when the venue reports the subscription dead;
    /// other errors are logged by the engine and the frame is skipped.
    async fn process_frame(
        &self,
        text: &str,
        sink: &mut WsSink,
    ) -> Result<Vec<Quote>, GatewayError>;

    /// Fetch the most recent candle per symbol over REST.
    ///
    /// Invoked by the engine when the stream has been idle past the
    /// inactivity timeout, immediately before reconnecting.
    ///
    /// # Errors
    /// `SubscribeRejected` to escalate a backfill failure into a fatal
    /// session error; any other error is logged and the reconnect proceeds.
    async fn backfill(&self, symbols: &[String]) -> Result<Vec<Quote>, GatewayError> {
        let _ = symbols;
        Ok(Vec::new())
    }
}

/// A venue registered with the router: resolves contract families, exposes
/// endpoints, and constructs decoders bound to the venue's pooled REST
/// client.
pub trait VenueConnector: Send + Sync {
    /// Venue name in its canonical lowercase form.
    fn name(&self) -> &'static str;

    /// Resolve a requested contract family to its canonical key, applying
    /// venue-specific aliases and the venue default when `requested` is
    /// absent.
    ///
    /// # Errors
    /// `UnsupportedContractType` for unknown families, or when the venue has
    /// no default and none was requested.
    fn resolve_family(&self, requested: Option<&str>) -> Result<String, GatewayError>;

    /// Endpoint for a canonical contract family.
    fn endpoint(&self, family: &str) -> Option<&VenueEndpoint>;

    /// Build a decoder for a canonical contract family.
    ///
    /// # Errors
    /// `UnsupportedContractType` for unknown families.
    fn decoder(&self, family: &str) -> Result<Arc<dyn VenueDecoder>, GatewayError>;
}
