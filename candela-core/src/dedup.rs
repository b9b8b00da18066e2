//! Quote deduplication across reconnection and backfill seams.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::Quote;

type DedupKey = (String, i64);

/// Suppresses quotes already delivered for a `(symbol, event-time-ms)` key.
///
/// A sliding time window bridges the overlap between a REST backfill and the
/// resumed stream after a reconnect; a hard entry cap bounds memory. One
/// instance exists per upstream session, so the venue is implicit in the key.
/// State is ephemeral and manipulated only by the owning session task.
#[derive(Debug)]
pub struct QuoteDeduplicator {
    window: Duration,
    max_entries: usize,
    seen: HashMap<DedupKey, Instant>,
    order: VecDeque<DedupKey>,
    duplicates: u64,
}

impl QuoteDeduplicator {
    /// Create a deduplicator with the given sliding window and entry cap.
    #[must_use]
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
            duplicates: 0,
        }
    }

    /// Check whether the quote was already seen inside the window, recording
    /// it when new. Returns `true` exactly when the quote should be dropped.
    pub fn is_duplicate(&mut self, quote: &Quote) -> bool {
        let now = Instant::now();
        self.prune(now);

        let key = quote.dedup_key();
        if self.seen.contains_key(&key) {
            self.duplicates += 1;
            tracing::debug!(
                symbol = %quote.symbol,
                event_time = %quote.event_time,
                "duplicate quote suppressed"
            );
            return true;
        }

        self.seen.insert(key.clone(), now);
        self.order.push_back(key);
        false
    }

    /// Entries currently tracked.
    #[must_use]
    pub fn tracked_entries(&self) -> usize {
        self.seen.len()
    }

    /// Duplicates suppressed so far.
    #[must_use]
    pub const fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Drop all tracked entries.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    fn prune(&mut self, now: Instant) {
        // Expire by window, oldest-inserted first.
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .is_none_or(|at| now.duration_since(*at) > self.window);
            if !expired {
                break;
            }
            let key = self.order.pop_front().expect("front checked above");
            self.seen.remove(&key);
        }

        // Enforce the cap by evicting the oldest insertions.
        while self.seen.len() >= self.max_entries {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            self.seen.remove(&key);
            tracing::warn!(
                max_entries = self.max_entries,
                "deduplication entry cap reached, evicting oldest entry"
            );
        }
    }
}
