//! Subscription router: shares upstream sessions across local subscribers.

mod shared;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::mpsc;

use candela_core::{GatewayError, Quote, Settings, VenueConnector};

use crate::engine;
use shared::{SharedSubscription, SubscriberGuard};

type SubKey = (String, String, Vec<String>);

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<SubKey, (u64, Arc<SharedSubscription>)>,
    venue_sessions: HashMap<String, usize>,
}

struct RouterInner {
    venues: HashMap<String, Arc<dyn VenueConnector>>,
    settings: Settings,
    registry: Mutex<Registry>,
}

impl RouterInner {
    fn release(&self, venue: &str, key: &SubKey, uid: u64) {
        let mut registry = self.registry.lock().expect("router registry poisoned");
        // Only remove the entry this subscription actually owns; the key may
        // have been re-registered by a newer session already.
        let owned = registry
            .subscriptions
            .get(key)
            .is_some_and(|(stored_uid, _)| *stored_uid == uid);
        if owned {
            registry.subscriptions.remove(key);
            if let Some(count) = registry.venue_sessions.get_mut(venue) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Builder for a [`Router`] over a set of registered venues.
pub struct RouterBuilder {
    venues: Vec<Arc<dyn VenueConnector>>,
    settings: Settings,
}

impl RouterBuilder {
    /// Start a builder with the given settings and no venues.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            venues: Vec::new(),
            settings,
        }
    }

    /// Register a venue connector.
    #[must_use]
    pub fn with_venue(mut self, venue: Arc<dyn VenueConnector>) -> Self {
        self.venues.push(venue);
        self
    }

    /// Build the router.
    ///
    /// # Errors
    /// `InvalidArg` when two registered venues share a name.
    pub fn build(self) -> Result<Router, GatewayError> {
        let mut venues: HashMap<String, Arc<dyn VenueConnector>> = HashMap::new();
        for venue in self.venues {
            let name = venue.name().to_string();
            if venues.insert(name.clone(), venue).is_some() {
                return Err(GatewayError::InvalidArg(format!(
                    "venue registered twice: {name}"
                )));
            }
        }
        Ok(Router {
            inner: Arc::new(RouterInner {
                venues,
                settings: self.settings,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }
}

/// Process-lived directory of shared upstream subscriptions.
///
/// Subscriptions are keyed by `(venue, contract family, sorted symbol
/// batch)`: two subscribers asking for the same batch share one upstream
/// session. A per-venue session counter caps upstream concurrency.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Start building a router.
    #[must_use]
    pub fn builder(settings: Settings) -> RouterBuilder {
        RouterBuilder::new(settings)
    }

    /// Open a subscription for `symbols` on one venue and contract family.
    ///
    /// Symbols are deduplicated, sorted, and split into endpoint-capped
    /// batches; each batch reuses a live shared session or registers a new
    /// one, subject to the venue's session cap.
    ///
    /// # Errors
    /// - `UnsupportedContractType` for unknown venues or families.
    /// - `InvalidArg` when `symbols` is empty.
    /// - `PoolBusy` when new sessions would exceed the venue cap.
    pub fn subscribe(
        &self,
        venue: &str,
        contract_type: Option<&str>,
        symbols: &[String],
    ) -> Result<Subscription, GatewayError> {
        let connector = self.inner.venues.get(venue).ok_or_else(|| {
            GatewayError::UnsupportedContractType(format!("unsupported venue: {venue}"))
        })?;
        let family = connector.resolve_family(contract_type)?;
        let endpoint = connector
            .endpoint(&family)
            .ok_or_else(|| {
                GatewayError::UnsupportedContractType(format!(
                    "unsupported contract type for {venue}: {family}"
                ))
            })?
            .clone();

        let sorted: Vec<String> = symbols
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if sorted.is_empty() {
            return Err(GatewayError::InvalidArg(
                "symbols list cannot be empty".to_string(),
            ));
        }
        let connector_settings = &self.inner.settings.connector;
        let cap = endpoint
            .max_symbols_per_session
            .min(connector_settings.max_symbols_per_session)
            .max(1);
        let batches: Vec<Vec<String>> = sorted.chunks(cap).map(<[String]>::to_vec).collect();

        let (mailbox_tx, mailbox_rx) =
            mpsc::channel(connector_settings.router_queue_max.max(1));
        let fail: Arc<OnceLock<GatewayError>> = Arc::new(OnceLock::new());

        // Declared before the registry guard: on an early error return the
        // guard unlocks first, so the detach in a dropped SubscriberGuard
        // cannot re-enter the registry mutex on this thread.
        let mut guards = Vec::with_capacity(batches.len());

        let mut registry = self.inner.registry.lock().expect("router registry poisoned");

        // Admission check before any session is created, so a rejected
        // subscribe leaves no half-registered state behind.
        let new_sessions = batches
            .iter()
            .filter(|batch| {
                let key = (venue.to_string(), family.clone(), (*batch).clone());
                !registry
                    .subscriptions
                    .get(&key)
                    .is_some_and(|(_, sub)| !sub.is_closed())
            })
            .count();
        let active = registry.venue_sessions.get(venue).copied().unwrap_or(0);
        let max_sessions = connector_settings.max_sessions_per_venue;
        if max_sessions > 0 && new_sessions > 0 && active + new_sessions > max_sessions {
            return Err(GatewayError::PoolBusy(venue.to_string()));
        }

        for batch in batches {
            let key = (venue.to_string(), family.clone(), batch.clone());

            let live = registry
                .subscriptions
                .get(&key)
                .filter(|(_, sub)| !sub.is_closed())
                .map(|(_, sub)| Arc::clone(sub));
            let live_id =
                live.as_ref().and_then(|sub| sub.attach(mailbox_tx.clone(), fail.clone()));

            let (subscription, id) = match (live, live_id) {
                (Some(sub), Some(id)) => (sub, id),
                _ => {
                    let decoder = connector.decoder(&family)?;
                    let (handle, engine_rx) =
                        engine::spawn(decoder, &endpoint, batch, connector_settings);

                    let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
                    let release_key = key.clone();
                    let release_venue = venue.to_string();
                    let uid_slot = Arc::new(OnceLock::<u64>::new());
                    let uid_for_release = Arc::clone(&uid_slot);
                    let sub = SharedSubscription::new(
                        handle,
                        Box::new(move || {
                            if let (Some(inner), Some(uid)) =
                                (weak.upgrade(), uid_for_release.get())
                            {
                                inner.release(&release_venue, &release_key, *uid);
                            }
                        }),
                    );
                    let _ = uid_slot.set(sub.uid());

                    // Attach before the pump starts so it can never observe
                    // an empty subscriber set for a freshly created session.
                    let id = sub
                        .attach(mailbox_tx.clone(), fail.clone())
                        .expect("fresh subscription accepts subscribers");
                    tokio::spawn(Arc::clone(&sub).pump(engine_rx));

                    // A closed predecessor may still occupy the key while its
                    // deferred release waits on this lock; settle its counter
                    // here so the release (uid mismatch) becomes a no-op.
                    if registry.subscriptions.remove(&key).is_some()
                        && let Some(count) = registry.venue_sessions.get_mut(venue)
                    {
                        *count = count.saturating_sub(1);
                    }
                    registry
                        .subscriptions
                        .insert(key, (sub.uid(), Arc::clone(&sub)));
                    *registry
                        .venue_sessions
                        .entry(venue.to_string())
                        .or_insert(0) += 1;

                    (sub, id)
                }
            };
            guards.push(SubscriberGuard::new(subscription, id));
        }
        drop(registry);

        Ok(Subscription {
            rx: mailbox_rx,
            fail,
            terminal_sent: false,
            _guards: guards,
        })
    }

    /// Interval label for a venue/contract pair, falling back to the
    /// configured default.
    #[must_use]
    pub fn interval(&self, venue: &str, contract_type: Option<&str>) -> String {
        self.inner
            .venues
            .get(venue)
            .and_then(|connector| {
                let family = connector.resolve_family(contract_type).ok()?;
                Some(connector.endpoint(&family)?.default_interval.clone())
            })
            .unwrap_or_else(|| self.inner.settings.connector.default_interval.clone())
    }

    /// Force-close every live shared subscription.
    ///
    /// Used during process shutdown: each close stops its upstream engine
    /// through the stream handle and drains the subscriber mailboxes, so
    /// attached clients observe a clean end of stream. Idempotent.
    pub fn shutdown(&self) {
        // Collect outside the registry lock: close() re-enters it through
        // the release callback.
        let subscriptions: Vec<Arc<SharedSubscription>> = {
            let registry = self.inner.registry.lock().expect("router registry poisoned");
            registry
                .subscriptions
                .values()
                .map(|(_, sub)| Arc::clone(sub))
                .collect()
        };
        if !subscriptions.is_empty() {
            tracing::info!(
                sessions = subscriptions.len(),
                "shutting down live upstream sessions"
            );
        }
        for subscription in subscriptions {
            subscription.close();
        }
    }

    /// Live upstream sessions registered for a venue.
    #[must_use]
    pub fn active_sessions(&self, venue: &str) -> usize {
        self.inner
            .registry
            .lock()
            .expect("router registry poisoned")
            .venue_sessions
            .get(venue)
            .copied()
            .unwrap_or(0)
    }
}

/// One local subscriber's view of a routed quote stream.
///
/// Dropping the subscription detaches its mailbox from every shared session;
/// the last detach cancels the upstream engine.
pub struct Subscription {
    rx: mpsc::Receiver<Result<Quote, GatewayError>>,
    fail: Arc<OnceLock<GatewayError>>,
    terminal_sent: bool,
    _guards: Vec<SubscriberGuard>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("terminal_sent", &self.terminal_sent)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Next quote, a terminal error, or `None` when the stream ended.
    ///
    /// Buffered quotes drain before a terminal error is reported, so a
    /// detached subscriber still sees everything it was delivered.
    pub async fn next(&mut self) -> Option<Result<Quote, GatewayError>> {
        if let Some(item) = self.rx.recv().await {
            return Some(item);
        }
        if self.terminal_sent {
            return None;
        }
        self.terminal_sent = true;
        self.fail.get().cloned().map(Err)
    }
}
