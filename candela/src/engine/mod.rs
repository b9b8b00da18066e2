//! Per-session streaming engine.
//!
//! One engine group drives the upstream sessions for one immutable symbol
//! batch set: a single session when the batch fits the endpoint cap, or one
//! session per batch fanned into a shared [`DualQueue`] when it does not.
//! The group produces a lazy sequence of quotes terminated by at most one
//! fatal error; cancellation goes through the returned [`StreamHandle`].

mod session;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use candela_core::{
    ConnectorSettings, DualQueue, GatewayError, Quote, StreamHandle, VenueDecoder, VenueEndpoint,
};

pub(crate) use session::QuoteResult;

const ENGINE_CHANNEL_CAPACITY: usize = 1024;

/// Spawn the engine group for `symbols` against one venue endpoint.
///
/// Returns a handle that stops every session in the group and the receiver
/// of the merged quote sequence. A `SubscribeRejected` from any batch (or a
/// spent breaker budget) arrives as a terminal `Err` item.
pub fn spawn(
    decoder: Arc<dyn VenueDecoder>,
    endpoint: &VenueEndpoint,
    symbols: Vec<String>,
    settings: &ConnectorSettings,
) -> (StreamHandle, mpsc::Receiver<Result<Quote, GatewayError>>) {
    let cap = endpoint.max_symbols_per_session.max(1);
    let batches: Vec<Vec<String>> = symbols.chunks(cap).map(<[String]>::to_vec).collect();

    let (tx, rx) = mpsc::channel::<QuoteResult>(ENGINE_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (stop_watch_tx, stop_watch_rx) = watch::channel(false);

    let mut joins = Vec::new();

    if batches.len() <= 1 {
        let batch = batches.into_iter().next().unwrap_or_default();
        joins.push(tokio::spawn(session::run_session(
            decoder,
            batch,
            settings.clone(),
            tx.clone(),
            stop_watch_rx.clone(),
        )));
    } else {
        tracing::info!(
            venue = decoder.venue(),
            sessions = batches.len(),
            symbols = symbols.len(),
            session_cap = cap,
            "splitting subscription across multiple upstream sessions"
        );
        let queue = Arc::new(DualQueue::new(
            settings.closed_queue_max,
            settings.open_queue_max,
        ));
        let (err_tx, mut err_rx) = mpsc::channel::<GatewayError>(batches.len());

        for batch in batches {
            let (session_tx, mut session_rx) = mpsc::channel::<QuoteResult>(ENGINE_CHANNEL_CAPACITY);
            joins.push(tokio::spawn(session::run_session(
                decoder.clone(),
                batch,
                settings.clone(),
                session_tx,
                stop_watch_rx.clone(),
            )));

            let queue = Arc::clone(&queue);
            let err_tx = err_tx.clone();
            joins.push(tokio::spawn(async move {
                while let Some(item) = session_rx.recv().await {
                    match item {
                        Ok(quote) => queue.put(quote).await,
                        Err(e) => {
                            let _ = err_tx.send(e).await;
                            return;
                        }
                    }
                }
            }));
        }
        drop(err_tx);

        let merged_tx = tx.clone();
        let mut merge_stop = stop_watch_rx.clone();
        joins.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = merge_stop.changed() => return,
                    fatal = err_rx.recv() => {
                        match fatal {
                            Some(e) => {
                                let _ = merged_tx.send(Err(e)).await;
                                return;
                            }
                            // All sessions finished without a fatal error.
                            None => return,
                        }
                    }
                    quote = queue.get() => {
                        if merged_tx.send(Ok(quote)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    let supervisor = tokio::spawn(async move {
        let mut stop_rx = stop_rx;
        tokio::select! {
            _ = &mut stop_rx => {}
            () = tx.closed() => {}
        }
        let _ = stop_watch_tx.send(true);
        for join in joins {
            let _ = join.await;
        }
    });

    (StreamHandle::new(supervisor, stop_tx), rx)
}
