//! Dual-priority fan-in queue separating final and provisional candles.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Notify, Semaphore};

use crate::Quote;

struct Buffers {
    closed: VecDeque<Quote>,
    open: VecDeque<Quote>,
}

/// Fan-in buffer that ranks closed candles above provisional updates.
///
/// Closed candles enter a bounded FIFO whose producers block when it is full
/// (backpressure; each blocking event is counted). Provisional candles enter
/// a LIFO stack; when the optional bound is exceeded the oldest (bottom)
/// element is dropped, which is information-preserving because a newer update
/// for the same bar supersedes it.
///
/// The consumer always drains the closed FIFO before popping the open LIFO
/// and waits when both are empty. Designed for many producer tasks and a
/// single consumer task.
#[derive(Debug)]
pub struct DualQueue {
    inner: Mutex<Buffers>,
    closed_slots: Semaphore,
    open_max: Option<usize>,
    available: Notify,
    blocking_events: AtomicU64,
    open_overflow_events: AtomicU64,
}

impl std::fmt::Debug for Buffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffers")
            .field("closed", &self.closed.len())
            .field("open", &self.open.len())
            .finish()
    }
}

impl DualQueue {
    /// Create a queue with the given closed-FIFO capacity and optional
    /// open-LIFO capacity (`None` = unbounded).
    #[must_use]
    pub fn new(closed_max: usize, open_max: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Buffers {
                closed: VecDeque::new(),
                open: VecDeque::new(),
            }),
            closed_slots: Semaphore::new(closed_max.max(1)),
            open_max,
            available: Notify::new(),
            blocking_events: AtomicU64::new(0),
            open_overflow_events: AtomicU64::new(0),
        }
    }

    /// Route a quote into the appropriate buffer.
    ///
    /// Blocks when the quote is final and the closed FIFO is full; never
    /// blocks for provisional quotes.
    pub async fn put(&self, quote: Quote) {
        if quote.is_final {
            let permit = match self.closed_slots.try_acquire() {
                Ok(p) => p,
                Err(_) => {
                    self.blocking_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        symbol = %quote.symbol,
                        blocking_events = self.blocking_events.load(Ordering::Relaxed),
                        "closed-candle queue full, applying backpressure"
                    );
                    self.closed_slots
                        .acquire()
                        .await
                        .expect("queue semaphore is never closed")
                }
            };
            permit.forget();
            self.inner
                .lock()
                .expect("queue mutex poisoned")
                .closed
                .push_back(quote);
        } else {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            if let Some(cap) = self.open_max
                && inner.open.len() >= cap
            {
                let dropped = inner.open.pop_front();
                self.open_overflow_events.fetch_add(1, Ordering::Relaxed);
                if let Some(dropped) = dropped {
                    tracing::warn!(
                        dropped_symbol = %dropped.symbol,
                        overflow_events = self.open_overflow_events.load(Ordering::Relaxed),
                        "open-candle stack overflow, dropping oldest update"
                    );
                }
            }
            inner.open.push_back(quote);
        }
        self.available.notify_one();
    }

    /// Take the next quote, closed FIFO first, then open LIFO, waiting when
    /// both buffers are empty. Cancel-safe: a cancelled `get` consumes
    /// nothing.
    pub async fn get(&self) -> Quote {
        loop {
            let notified = self.available.notified();
            if let Some(quote) = self.try_get() {
                return quote;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`get`](Self::get).
    #[must_use]
    pub fn try_get(&self) -> Option<Quote> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if let Some(quote) = inner.closed.pop_front() {
            self.closed_slots.add_permits(1);
            return Some(quote);
        }
        inner.open.pop_back()
    }

    /// Whether both buffers are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        inner.closed.is_empty() && inner.open.is_empty()
    }

    /// Current closed-FIFO depth.
    #[must_use]
    pub fn closed_len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").closed.len()
    }

    /// Current open-LIFO depth.
    #[must_use]
    pub fn open_len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").open.len()
    }

    /// Times a producer found the closed FIFO full and had to wait.
    #[must_use]
    pub fn blocking_events(&self) -> u64 {
        self.blocking_events.load(Ordering::Relaxed)
    }

    /// Provisional updates dropped to stay within the open-LIFO bound.
    #[must_use]
    pub fn open_overflow_events(&self) -> u64 {
        self.open_overflow_events.load(Ordering::Relaxed)
    }
}
