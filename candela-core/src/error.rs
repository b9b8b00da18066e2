use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable wire-level error codes for the downstream streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The upstream venue connection could not be established.
    WsConnectFailed,
    /// The subscription was rejected (bad envelope or venue refusal).
    WsSubscribeRejected,
    /// No data arrived within the configured idle window.
    WsStreamTimeout,
    /// The client payload was not a valid protocol message.
    WsProtocolError,
    /// A REST backfill request failed fatally.
    RestBackfillFailed,
    /// The venue rate-limited the subscription.
    RateLimited,
    /// The requested contract family is unknown for the venue.
    UnsupportedContractType,
    /// The venue reported an invalid symbol.
    InvalidSymbol,
    /// A local subscriber mailbox overflowed and was detached.
    InternalQueueBackpressure,
    /// The venue's session pool is at capacity.
    ConnectionPoolBusy,
    /// Anything not covered above.
    Unknown,
}

/// Unified error type for the candela workspace.
///
/// Wraps transport failures, subscribe-time rejections, validation errors,
/// and the local backpressure / capacity conditions, each mapping onto one
/// wire-level [`ErrorCode`].
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The upstream connection could not be established.
    #[error("websocket connect failed: {0}")]
    ConnectFailed(String),

    /// A subscription could not be established for the provided symbols.
    /// Fatal for the session; never retried.
    #[error("subscription rejected: {message}")]
    SubscribeRejected {
        /// Human-readable description of the refusal.
        message: String,
        /// Verbatim message from the venue, when one was received.
        exchange_message: Option<String>,
    },

    /// No data arrived within an idle window.
    #[error("stream timed out: {0}")]
    StreamTimeout(String),

    /// A payload could not be parsed as a protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A REST backfill request failed.
    #[error("rest backfill failed: {0}")]
    BackfillFailed(String),

    /// The requested contract family is not supported by the venue.
    #[error("unsupported contract type: {0}")]
    UnsupportedContractType(String),

    /// Invalid input argument (envelope validation, configuration).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A subscriber mailbox overflowed; the subscriber is detached.
    #[error("subscriber mailbox overflowed; dropping subscriber")]
    QueueBackpressure,

    /// The per-venue session cap is reached.
    #[error("session pool at capacity for venue {0}")]
    PoolBusy(String),

    /// Unknown/opaque error.
    #[error("unknown error: {0}")]
    Other(String),
}

impl GatewayError {
    /// Helper: build a `SubscribeRejected` carrying the venue's own message.
    pub fn subscribe_rejected(
        message: impl Into<String>,
        exchange_message: Option<String>,
    ) -> Self {
        Self::SubscribeRejected {
            message: message.into(),
            exchange_message,
        }
    }

    /// Helper: build a `ConnectFailed` error.
    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    /// The verbatim venue message, when this error carries one.
    #[must_use]
    pub fn exchange_message(&self) -> Option<&str> {
        match self {
            Self::SubscribeRejected {
                exchange_message, ..
            } => exchange_message.as_deref(),
            _ => None,
        }
    }

    /// Map the error onto its wire-level code.
    ///
    /// `SubscribeRejected` is classified from the venue message: rate-limit
    /// wording maps to [`ErrorCode::RateLimited`], backfill/REST wording to
    /// [`ErrorCode::RestBackfillFailed`], symbol wording to
    /// [`ErrorCode::InvalidSymbol`], anything else to the generic rejection.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectFailed(_) => ErrorCode::WsConnectFailed,
            Self::SubscribeRejected {
                message,
                exchange_message,
            } => {
                let text = exchange_message
                    .as_deref()
                    .unwrap_or(message)
                    .to_ascii_lowercase();
                if text.contains("rate limit") || text.contains("ratelimit") {
                    ErrorCode::RateLimited
                } else if text.contains("backfill") || text.contains("rest") {
                    ErrorCode::RestBackfillFailed
                } else if text.contains("symbol") {
                    ErrorCode::InvalidSymbol
                } else {
                    ErrorCode::WsSubscribeRejected
                }
            }
            Self::StreamTimeout(_) => ErrorCode::WsStreamTimeout,
            Self::Protocol(_) => ErrorCode::WsProtocolError,
            Self::BackfillFailed(_) => ErrorCode::RestBackfillFailed,
            Self::UnsupportedContractType(_) => ErrorCode::UnsupportedContractType,
            Self::InvalidArg(_) => ErrorCode::WsSubscribeRejected,
            Self::QueueBackpressure => ErrorCode::InternalQueueBackpressure,
            Self::PoolBusy(_) => ErrorCode::ConnectionPoolBusy,
            Self::Other(_) => ErrorCode::Unknown,
        }
    }
}

/// Terminal error event sent to a downstream client.
///
/// Optional fields are omitted from the payload when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Constant `"error"` tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Wire-level error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Venue echoed from the subscription, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    /// Contract family echoed from the subscription, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    /// Symbols echoed from the subscription, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    /// Verbatim message from the venue, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_message: Option<String>,
}

impl ErrorEvent {
    /// Build an error event with no subscription context attached.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            code,
            message: message.into(),
            exchange: None,
            contract_type: None,
            symbols: None,
            exchange_message: None,
        }
    }

    /// Attach the venue name.
    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Attach the contract family.
    #[must_use]
    pub fn with_contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = Some(contract_type.into());
        self
    }

    /// Attach the subscribed symbols.
    #[must_use]
    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    /// Attach the venue's verbatim message.
    #[must_use]
    pub fn with_exchange_message(mut self, msg: impl Into<String>) -> Self {
        self.exchange_message = Some(msg.into());
        self
    }
}
