//! Pooled outbound HTTP clients for REST backfill.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::{ConnectorSettings, GatewayError};

/// Directory of long-lived HTTP clients, one per venue.
///
/// Clients are built lazily from the connector settings and shared across
/// every engine of the venue; `reqwest` clients are cheap to clone and pool
/// connections internally. [`shutdown`](RestPool::shutdown) drops the pooled
/// clients during graceful shutdown.
#[derive(Debug)]
pub struct RestPool {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    timeout: Duration,
    idle_per_host: usize,
    max_inflight: usize,
}

impl RestPool {
    /// Build a pool from connector settings.
    #[must_use]
    pub fn new(settings: &ConnectorSettings) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            timeout: settings.rest_timeout,
            idle_per_host: settings.rest_pool_connections,
            max_inflight: settings.rest_pool_maxsize.max(1),
        }
    }

    /// Get (or lazily build) the pooled client for a venue.
    ///
    /// # Errors
    /// `Other` when the client cannot be constructed.
    pub fn client(&self, venue: &str) -> Result<reqwest::Client, GatewayError> {
        let mut clients = self.clients.lock().expect("rest pool mutex poisoned");
        if let Some(client) = clients.get(venue) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(self.idle_per_host)
            .build()
            .map_err(|e| GatewayError::Other(format!("failed to build http client: {e}")))?;
        clients.insert(venue.to_string(), client.clone());
        Ok(client)
    }

    /// Upper bound on concurrent in-flight backfill requests per venue.
    #[must_use]
    pub const fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    /// Release every pooled client. Called during graceful shutdown.
    pub fn shutdown(&self) {
        self.clients
            .lock()
            .expect("rest pool mutex poisoned")
            .clear();
    }
}
