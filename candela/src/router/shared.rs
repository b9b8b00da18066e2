//! One upstream engine fanned out to N local subscriber mailboxes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use candela_core::{GatewayError, Quote, StreamHandle};

pub(crate) type QuoteResult = Result<Quote, GatewayError>;

struct SubscriberSlot {
    tx: mpsc::Sender<QuoteResult>,
    /// Terminal error surfaced to the subscriber once its mailbox closes.
    fail: Arc<OnceLock<GatewayError>>,
}

/// Fan-out of one upstream engine to any number of local subscribers.
///
/// The pump task multiplies every quote into each live mailbox without
/// blocking: an overflowing subscriber is detached with a terminal
/// backpressure error while the others keep streaming. When the last
/// subscriber detaches the engine handle is dropped (stop + abort) and the
/// registry entry is released.
pub(crate) struct SharedSubscription {
    uid: u64,
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_subscriber_id: AtomicU64,
    closed: AtomicBool,
    /// Engine-fatal error propagated to every subscriber still attached when
    /// the subscription winds down.
    terminal: OnceLock<GatewayError>,
    handle: Mutex<Option<StreamHandle>>,
    on_release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

impl SharedSubscription {
    pub fn new(handle: StreamHandle, on_release: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        Arc::new(Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            terminal: OnceLock::new(),
            handle: Mutex::new(Some(handle)),
            on_release: Mutex::new(Some(on_release)),
        })
    }

    /// Identity used by the router registry to guard against stale releases.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach a subscriber mailbox. Returns `None` when the subscription has
    /// already closed (the caller should build a fresh one).
    pub fn attach(
        &self,
        tx: mpsc::Sender<QuoteResult>,
        fail: Arc<OnceLock<GatewayError>>,
    ) -> Option<u64> {
        let mut subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        if self.is_closed() {
            return None;
        }
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(id, SubscriberSlot { tx, fail });
        Some(id)
    }

    /// Detach one subscriber; tears the upstream down when it was the last.
    pub fn detach(&self, id: u64) {
        let now_empty = {
            let mut subscribers = self.subscribers.lock().expect("subscriber map poisoned");
            subscribers.remove(&id);
            subscribers.is_empty()
        };
        if now_empty {
            self.close();
        }
    }

    /// Tear the subscription down: stop the engine, release the registry
    /// entry, and close every remaining mailbox. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the handle sends a best-effort stop and aborts the engine.
        drop(self.handle.lock().expect("handle slot poisoned").take());
        if let Some(release) = self
            .on_release
            .lock()
            .expect("release slot poisoned")
            .take()
        {
            release();
        }
        let mut subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        for (_, slot) in subscribers.drain() {
            if let Some(e) = self.terminal.get() {
                let _ = slot.fail.set(e.clone());
            }
        }
    }

    /// Pump loop: forward the engine's output to every live mailbox.
    pub async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<QuoteResult>) {
        while let Some(item) = rx.recv().await {
            match item {
                Ok(quote) => {
                    if !self.fan_out(&quote) {
                        break;
                    }
                }
                Err(e) => {
                    // Engine-fatal: every subscriber sees the same terminal
                    // error when its mailbox drains.
                    let _ = self.terminal.set(e);
                    break;
                }
            }
        }
        self.close();
    }

    /// Returns `false` once no live subscribers remain.
    fn fan_out(&self, quote: &Quote) -> bool {
        let mut overflowed: Vec<u64> = Vec::new();
        let mut gone: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("subscriber map poisoned");
            if subscribers.is_empty() {
                return false;
            }
            for (id, slot) in subscribers.iter() {
                match slot.tx.try_send(Ok(quote.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => overflowed.push(*id),
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        if !(overflowed.is_empty() && gone.is_empty()) {
            let mut subscribers = self.subscribers.lock().expect("subscriber map poisoned");
            for id in gone {
                subscribers.remove(&id);
            }
            for id in overflowed {
                if let Some(slot) = subscribers.remove(&id) {
                    tracing::warn!(
                        subscriber = id,
                        "subscriber mailbox overflowed, detaching with backpressure error"
                    );
                    let _ = slot.fail.set(GatewayError::QueueBackpressure);
                }
            }
            if subscribers.is_empty() {
                return false;
            }
        }
        true
    }
}

/// Guard that detaches one subscriber from one shared subscription on drop.
pub(crate) struct SubscriberGuard {
    subscription: Arc<SharedSubscription>,
    id: u64,
}

impl SubscriberGuard {
    pub fn new(subscription: Arc<SharedSubscription>, id: u64) -> Self {
        Self { subscription, id }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.subscription.detach(self.id);
    }
}
