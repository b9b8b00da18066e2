//! Single upstream connection: connect, subscribe, receive, idle-detect,
//! backfill, reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use candela_core::{
    Admission, CircuitBreaker, ConnectorSettings, GatewayError, Quote, QuoteDeduplicator,
    VenueDecoder, WsSink,
};

pub(crate) type QuoteResult = Result<Quote, GatewayError>;

enum ConnectionOutcome {
    /// Recycle the socket and reconnect.
    Recycle,
    /// The session is finished (stop signal or downstream gone).
    Done,
}

/// Add up to 20% random jitter so reconnecting sessions do not stampede.
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.0..0.2_f64);
    delay.mul_f64(1.0 + jitter)
}

/// Sleep for `delay`, returning `true` if the stop signal fired first.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}

/// Drive one upstream session over `symbols` until stopped, fatally rejected,
/// or the downstream receiver goes away.
///
/// Transient transport failures are retried under circuit-breaker control and
/// never surface downstream; a `SubscribeRejected` (or a breaker whose retry
/// budget is spent) is delivered as the terminal `Err` item.
pub(crate) async fn run_session(
    decoder: Arc<dyn VenueDecoder>,
    symbols: Vec<String>,
    settings: ConnectorSettings,
    tx: mpsc::Sender<QuoteResult>,
    mut stop: watch::Receiver<bool>,
) {
    let venue = decoder.venue();
    // Backoff saturates at 10x the base recovery window (30s -> 300s with
    // the defaults); a saturated schedule is the session's retry budget.
    let mut breaker = CircuitBreaker::new(
        settings.breaker_failure_threshold,
        settings.breaker_recovery_timeout,
        settings.breaker_half_open_max_calls,
    )
    .with_max_backoff(settings.breaker_recovery_timeout * 10);
    let mut dedup = QuoteDeduplicator::new(settings.dedup_window, settings.dedup_max_entries);

    loop {
        if *stop.borrow() {
            return;
        }

        match breaker.admit() {
            Admission::Allowed => {}
            Admission::Wait(hint) => {
                if breaker.budget_exhausted() {
                    tracing::error!(
                        venue,
                        failures = breaker.failure_count(),
                        "breaker retry budget exhausted, giving up on session"
                    );
                    let _ = tx
                        .send(Err(GatewayError::connect_failed(format!(
                            "{venue} connection failed after repeated attempts"
                        ))))
                        .await;
                    return;
                }
                tracing::warn!(
                    venue,
                    wait_secs = hint.as_secs_f64(),
                    failures = breaker.failure_count(),
                    "circuit breaker open, delaying reconnect"
                );
                if wait_or_stop(&mut stop, hint.max(settings.reconnect_delay)).await {
                    return;
                }
                continue;
            }
        }

        match run_connection(
            &*decoder,
            &symbols,
            &settings,
            &tx,
            &mut stop,
            &mut breaker,
            &mut dedup,
        )
        .await
        {
            Ok(ConnectionOutcome::Recycle) => {}
            Ok(ConnectionOutcome::Done) => return,
            Err(fatal) => {
                tracing::error!(venue, error = %fatal, "session failed fatally");
                let _ = tx.send(Err(fatal)).await;
                return;
            }
        }

        if wait_or_stop(&mut stop, jittered(settings.reconnect_delay)).await {
            return;
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_connection(
    decoder: &dyn VenueDecoder,
    symbols: &[String],
    settings: &ConnectorSettings,
    tx: &mpsc::Sender<QuoteResult>,
    stop: &mut watch::Receiver<bool>,
    breaker: &mut CircuitBreaker,
    dedup: &mut QuoteDeduplicator,
) -> Result<ConnectionOutcome, GatewayError> {
    let venue = decoder.venue();
    let args = decoder.connect_args(symbols)?;
    let mut request = args.url.as_str().into_client_request().map_err(|e| {
        GatewayError::subscribe_rejected(format!("invalid stream url {}: {e}", args.url), None)
    })?;
    for (name, value) in &args.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            GatewayError::subscribe_rejected(format!("invalid connect header {name}: {e}"), None)
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            GatewayError::subscribe_rejected(format!("invalid connect header value: {e}"), None)
        })?;
        request.headers_mut().insert(name, value);
    }

    let ws = tokio::select! {
        _ = stop.changed() => return Ok(ConnectionOutcome::Done),
        connected = tokio::time::timeout(settings.inactivity_timeout, connect_async(request)) => {
            match connected {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    tracing::warn!(venue, error = %e, "websocket connect failed, retrying");
                    breaker.on_failure();
                    return Ok(ConnectionOutcome::Recycle);
                }
                Err(_) => {
                    tracing::warn!(
                        venue,
                        timeout_secs = settings.inactivity_timeout.as_secs_f64(),
                        "websocket connect timed out, retrying"
                    );
                    breaker.on_failure();
                    return Ok(ConnectionOutcome::Recycle);
                }
            }
        }
    };

    let (mut sink, mut frames) = ws.split();
    if let Err(e) = decoder.on_connected(&mut sink, symbols).await {
        if matches!(e, GatewayError::SubscribeRejected { .. }) {
            return Err(e);
        }
        tracing::warn!(venue, error = %e, "subscribe frames failed, retrying");
        breaker.on_failure();
        return Ok(ConnectionOutcome::Recycle);
    }
    breaker.on_success();
    tracing::info!(venue, symbols = symbols.len(), "upstream session streaming");

    let mut last_frame = Instant::now();
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ws_ping_interval,
        settings.ws_ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending_ping: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = stop.changed() => return Ok(ConnectionOutcome::Done),

            () = tokio::time::sleep_until(last_frame + settings.inactivity_timeout) => {
                tracing::warn!(
                    venue,
                    idle_secs = settings.inactivity_timeout.as_secs_f64(),
                    "no upstream updates, performing rest backfill and reconnect"
                );
                match decoder.backfill(symbols).await {
                    Ok(quotes) => {
                        if deliver(quotes, dedup, tx).await.is_err() {
                            return Ok(ConnectionOutcome::Done);
                        }
                    }
                    Err(e @ GatewayError::SubscribeRejected { .. }) => return Err(e),
                    Err(e) => {
                        tracing::warn!(venue, error = %e, "backfill failed during idle recovery");
                    }
                }
                return Ok(ConnectionOutcome::Recycle);
            }

            _ = ping.tick() => {
                if let Some(sent_at) = pending_ping
                    && sent_at.elapsed() >= settings.ws_ping_timeout
                {
                    tracing::warn!(venue, "upstream ping unanswered, reconnecting");
                    breaker.on_failure();
                    return Ok(ConnectionOutcome::Recycle);
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    tracing::warn!(venue, "upstream ping send failed, reconnecting");
                    breaker.on_failure();
                    return Ok(ConnectionOutcome::Recycle);
                }
                if pending_ping.is_none() {
                    pending_ping = Some(Instant::now());
                }
            }

            frame = frames.next() => {
                match frame {
                    Some(Ok(message)) => {
                        last_frame = Instant::now();
                        match message {
                            Message::Text(text) => {
                                match process(decoder, text.as_str(), &mut sink, dedup, tx).await? {
                                    ConnectionOutcome::Recycle => {}
                                    ConnectionOutcome::Done => return Ok(ConnectionOutcome::Done),
                                }
                            }
                            Message::Binary(bytes) => {
                                if let Ok(text) = std::str::from_utf8(&bytes) {
                                    match process(decoder, text, &mut sink, dedup, tx).await? {
                                        ConnectionOutcome::Recycle => {}
                                        ConnectionOutcome::Done => return Ok(ConnectionOutcome::Done),
                                    }
                                }
                            }
                            Message::Ping(payload) => {
                                let _ = sink.send(Message::Pong(payload)).await;
                            }
                            Message::Pong(_) => {
                                pending_ping = None;
                            }
                            Message::Close(_) => {
                                tracing::info!(venue, "upstream closed cleanly, reconnecting");
                                return Ok(ConnectionOutcome::Recycle);
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(venue, error = %e, "upstream receive error, reconnecting");
                        breaker.on_failure();
                        return Ok(ConnectionOutcome::Recycle);
                    }
                    None => {
                        tracing::info!(venue, "upstream stream ended, reconnecting");
                        return Ok(ConnectionOutcome::Recycle);
                    }
                }
            }
        }
    }
}

// Decode one frame and push the surviving quotes downstream.
// `Done` means the downstream receiver went away.
async fn process(
    decoder: &dyn VenueDecoder,
    text: &str,
    sink: &mut WsSink,
    dedup: &mut QuoteDeduplicator,
    tx: &mpsc::Sender<QuoteResult>,
) -> Result<ConnectionOutcome, GatewayError> {
    match decoder.process_frame(text, sink).await {
        Ok(quotes) => {
            if deliver(quotes, dedup, tx).await.is_err() {
                return Ok(ConnectionOutcome::Done);
            }
            Ok(ConnectionOutcome::Recycle)
        }
        Err(e @ GatewayError::SubscribeRejected { .. }) => Err(e),
        Err(e) => {
            tracing::debug!(venue = decoder.venue(), error = %e, "skipping undecodable frame");
            Ok(ConnectionOutcome::Recycle)
        }
    }
}

async fn deliver(
    quotes: Vec<Quote>,
    dedup: &mut QuoteDeduplicator,
    tx: &mpsc::Sender<QuoteResult>,
) -> Result<(), ()> {
    for quote in quotes {
        if dedup.is_duplicate(&quote) {
            continue;
        }
        if tx.send(Ok(quote)).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}
