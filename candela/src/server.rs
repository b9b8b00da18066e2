//! Downstream WebSocket endpoint.
//!
//! One streaming connection per client: read exactly one subscribe envelope,
//! acknowledge, attach a router subscription, and push normalized candle
//! events until the client disconnects, the limit is reached, or a terminal
//! error is translated onto the wire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use candela_core::{ErrorCode, ErrorEvent, GatewayError, Settings};

use crate::router::Router;

type ClientSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ClientStream = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct SubscribedEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    exchange: &'a str,
    contract_type: Option<&'a str>,
    symbols: &'a [String],
    limit: u64,
}

struct Envelope {
    exchange: String,
    symbols: Vec<String>,
    contract_type: Option<String>,
    limit: u64,
}

/// Accept clients until the shutdown signal fires, then cancel every live
/// upstream session before returning.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    settings: Arc<Settings>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("websocket server ready to accept connections");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "client connected");
                        let router = router.clone();
                        let settings = Arc::clone(&settings);
                        tokio::spawn(handle_client(stream, router, settings));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept client connection");
                    }
                }
            }
        }
    }
    tracing::info!("websocket server stopped accepting connections");
    // Cancel live engines; attached clients see a clean end of stream and
    // their handler tasks wind down on their own.
    router.shutdown();
    tracing::info!("websocket server shutdown complete");
}

async fn handle_client(stream: TcpStream, router: Router, settings: Arc<Settings>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut frames) = ws.split();

    let subscribe_timeout = settings.server.subscribe_timeout;
    let raw = match read_envelope(&mut frames, subscribe_timeout).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(_) => {
            send_event(
                &mut sink,
                &ErrorEvent::new(
                    ErrorCode::WsStreamTimeout,
                    format!(
                        "no subscription payload received within {:.0} seconds",
                        subscribe_timeout.as_secs_f64()
                    ),
                ),
            )
            .await;
            return;
        }
    };

    let payload: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => {
            send_event(
                &mut sink,
                &ErrorEvent::new(
                    ErrorCode::WsProtocolError,
                    "subscription payload must be valid JSON",
                ),
            )
            .await;
            return;
        }
    };

    let exchange_hint = payload
        .get("exchange")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string);
    let envelope = match validate_envelope(&payload) {
        Ok(envelope) => envelope,
        Err(message) => {
            let mut event = ErrorEvent::new(ErrorCode::WsSubscribeRejected, message);
            if let Some(exchange) = exchange_hint {
                event = event.with_exchange(exchange);
            }
            send_event(&mut sink, &event).await;
            return;
        }
    };

    tracing::info!(
        exchange = %envelope.exchange,
        contract_type = ?envelope.contract_type,
        symbols = envelope.symbols.len(),
        limit = envelope.limit,
        "client subscribed"
    );
    let ack = SubscribedEvent {
        kind: "subscribed",
        exchange: &envelope.exchange,
        contract_type: envelope.contract_type.as_deref(),
        symbols: &envelope.symbols,
        limit: envelope.limit,
    };
    if !send_event(&mut sink, &ack).await {
        return;
    }

    let interval = router.interval(&envelope.exchange, envelope.contract_type.as_deref());
    let mut subscription = match router.subscribe(
        &envelope.exchange,
        envelope.contract_type.as_deref(),
        &envelope.symbols,
    ) {
        Ok(subscription) => subscription,
        Err(e) => {
            send_event(&mut sink, &stream_error_event(&e, &envelope)).await;
            return;
        }
    };

    let idle_timeout = settings.connector.stream_idle_timeout;
    let mut delivered: u64 = 0;
    loop {
        match tokio::time::timeout(idle_timeout, subscription.next()).await {
            Err(_) => {
                let message = format!(
                    "no quotes received for {:.0} seconds from {}::{}; subscription cancelled",
                    idle_timeout.as_secs_f64(),
                    envelope.exchange,
                    envelope.contract_type.as_deref().unwrap_or("default"),
                );
                send_event(
                    &mut sink,
                    &with_context(
                        ErrorEvent::new(ErrorCode::WsStreamTimeout, message),
                        &envelope,
                    ),
                )
                .await;
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                send_event(&mut sink, &stream_error_event(&e, &envelope)).await;
                break;
            }
            Ok(Some(Ok(quote))) => {
                let event = quote.to_candle_event(Utc::now(), &interval);
                if !send_event(&mut sink, &event).await {
                    tracing::info!("client disconnected");
                    break;
                }
                if envelope.limit > 0 {
                    delivered += 1;
                    if delivered >= envelope.limit {
                        break;
                    }
                }
            }
        }
    }
    // Dropping the subscription detaches this client's mailbox.
}

async fn read_envelope(
    frames: &mut ClientStream,
    timeout: Duration,
) -> Result<Option<String>, tokio::time::error::Elapsed> {
    tokio::time::timeout(timeout, async {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await
}

fn validate_envelope(payload: &serde_json::Value) -> Result<Envelope, String> {
    let Some(object) = payload.as_object() else {
        return Err("subscription payload must be an object".to_string());
    };

    let exchange = match object.get("exchange").and_then(serde_json::Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return Err("field 'exchange' is required and must be a non-empty string".to_string()),
    };

    let symbols = match object.get("symbols").and_then(serde_json::Value::as_array) {
        Some(list) if !list.is_empty() => {
            let mut symbols = Vec::with_capacity(list.len());
            for entry in list {
                match entry.as_str() {
                    Some(s) if !s.is_empty() => symbols.push(s.to_string()),
                    _ => return Err("each symbol must be a non-empty string".to_string()),
                }
            }
            symbols
        }
        _ => return Err("field 'symbols' is required and must be a non-empty list".to_string()),
    };

    let contract_type = match object.get("contract_type") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(_) => {
            return Err("field 'contract_type' must be a non-empty string when provided".to_string());
        }
    };

    let limit = match object.get("limit") {
        None | Some(serde_json::Value::Null) => 0,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| "field 'limit' must be a non-negative integer".to_string())?,
    };

    Ok(Envelope {
        exchange,
        symbols,
        contract_type,
        limit,
    })
}

fn with_context(event: ErrorEvent, envelope: &Envelope) -> ErrorEvent {
    let mut event = event
        .with_exchange(envelope.exchange.clone())
        .with_symbols(envelope.symbols.clone());
    if let Some(contract_type) = &envelope.contract_type {
        event = event.with_contract_type(contract_type.clone());
    }
    event
}

fn stream_error_event(error: &GatewayError, envelope: &Envelope) -> ErrorEvent {
    let message = match error {
        GatewayError::SubscribeRejected { .. } => "subscription rejected by exchange".to_string(),
        GatewayError::Other(cause) => format!("internal streaming error: {cause}"),
        other => other.to_string(),
    };
    let mut event = with_context(ErrorEvent::new(error.code(), message), envelope);
    match error {
        GatewayError::SubscribeRejected {
            message,
            exchange_message,
        } => {
            event = event.with_exchange_message(
                exchange_message.clone().unwrap_or_else(|| message.clone()),
            );
        }
        GatewayError::Other(cause) => {
            event = event.with_exchange_message(cause.clone());
        }
        _ => {}
    }
    event
}

async fn send_event<T: Serialize>(sink: &mut ClientSink, event: &T) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound event");
            false
        }
    }
}
