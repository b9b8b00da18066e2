//! Process configuration with environment overrides.

use std::time::Duration;

use crate::GatewayError;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, GatewayError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| {
                GatewayError::InvalidArg(format!(
                    "environment variable {name} must be a non-negative number of seconds"
                ))
            }),
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize, GatewayError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            GatewayError::InvalidArg(format!("environment variable {name} must be an integer"))
        }),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, GatewayError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<u32>().map_err(|_| {
            GatewayError::InvalidArg(format!("environment variable {name} must be an integer"))
        }),
    }
}

fn env_u16(name: &str, default: u16) -> Result<u16, GatewayError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            GatewayError::InvalidArg(format!("environment variable {name} must be a port number"))
        }),
    }
}

fn env_string(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    env_var(name).map_or(default, |raw| raw.eq_ignore_ascii_case("true"))
}

/// Settings for the upstream connector machinery (engines, breaker, queues,
/// dedup, REST pooling).
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Wall-clock limit on silence from an upstream socket before the
    /// backfill-and-reconnect cycle kicks in.
    pub inactivity_timeout: Duration,
    /// Delay between reconnect attempts outside breaker-imposed waits.
    pub reconnect_delay: Duration,
    /// Per-request timeout for REST backfill calls.
    pub rest_timeout: Duration,
    /// Interval between transport-level pings on upstream sockets.
    pub ws_ping_interval: Duration,
    /// How long an unanswered transport ping is tolerated.
    pub ws_ping_timeout: Duration,
    /// Limit on silence observed by a downstream subscriber before its
    /// subscription is cancelled.
    pub stream_idle_timeout: Duration,
    /// Upper bound on symbols multiplexed over one upstream session.
    pub max_symbols_per_session: usize,
    /// Consecutive failures before the circuit breaker opens.
    pub breaker_failure_threshold: u32,
    /// Base recovery timeout for an open breaker.
    pub breaker_recovery_timeout: Duration,
    /// Probe calls admitted in the half-open state.
    pub breaker_half_open_max_calls: u32,
    /// Capacity of the closed-candle FIFO (producers block when full).
    pub closed_queue_max: usize,
    /// Capacity of the open-candle LIFO; `None` means unbounded.
    pub open_queue_max: Option<usize>,
    /// Sliding window for quote deduplication.
    pub dedup_window: Duration,
    /// Hard cap on tracked deduplication entries.
    pub dedup_max_entries: usize,
    /// Idle connections kept per pooled REST client.
    pub rest_pool_connections: usize,
    /// Upper bound on concurrent in-flight backfill requests.
    pub rest_pool_maxsize: usize,
    /// Interval label used when a venue endpoint does not declare one.
    pub default_interval: String,
    /// Capacity of each local subscriber mailbox.
    pub router_queue_max: usize,
    /// Upper bound on concurrent upstream sessions per venue.
    pub max_sessions_per_venue: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(1),
            rest_timeout: Duration::from_secs(5),
            ws_ping_interval: Duration::from_secs(20),
            ws_ping_timeout: Duration::from_secs(20),
            stream_idle_timeout: Duration::from_secs(10),
            max_symbols_per_session: 50,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(30),
            breaker_half_open_max_calls: 1,
            closed_queue_max: 1000,
            open_queue_max: None,
            dedup_window: Duration::from_secs(120),
            dedup_max_entries: 10_000,
            rest_pool_connections: 10,
            rest_pool_maxsize: 20,
            default_interval: "1m".to_string(),
            router_queue_max: 1000,
            max_sessions_per_venue: 5,
        }
    }
}

/// Settings for the downstream WebSocket server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Host/IP the server binds to.
    pub host: String,
    /// Port the server binds to.
    pub port: u16,
    /// Limit on how long a client may take to send its subscribe envelope.
    pub subscribe_timeout: Duration,
    /// Port for the liveness/readiness server, when one is attached.
    pub health_check_port: u16,
    /// Whether the liveness/readiness server should be attached.
    pub health_check_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            subscribe_timeout: Duration::from_secs(10),
            health_check_port: 8766,
            health_check_enabled: true,
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Upstream connector settings.
    pub connector: ConnectorSettings,
    /// Downstream server settings.
    pub server: ServerSettings,
}

impl Settings {
    /// Load settings from the environment, falling back to the documented
    /// defaults. Every option is overridable through a `CANDELA_*` variable.
    ///
    /// # Errors
    /// `InvalidArg` when a set variable cannot be parsed into its type.
    pub fn from_env() -> Result<Self, GatewayError> {
        let d = ConnectorSettings::default();
        let open_queue_max = match env_usize("CANDELA_OPEN_QUEUE_MAX", 0)? {
            0 => None,
            n => Some(n),
        };
        let connector = ConnectorSettings {
            inactivity_timeout: env_secs("CANDELA_INACTIVITY_TIMEOUT", d.inactivity_timeout)?,
            reconnect_delay: env_secs("CANDELA_RECONNECT_DELAY", d.reconnect_delay)?,
            rest_timeout: env_secs("CANDELA_REST_TIMEOUT", d.rest_timeout)?,
            ws_ping_interval: env_secs("CANDELA_WS_PING_INTERVAL", d.ws_ping_interval)?,
            ws_ping_timeout: env_secs("CANDELA_WS_PING_TIMEOUT", d.ws_ping_timeout)?,
            stream_idle_timeout: env_secs("CANDELA_STREAM_IDLE_TIMEOUT", d.stream_idle_timeout)?,
            max_symbols_per_session: env_usize(
                "CANDELA_MAX_SYMBOLS_PER_SESSION",
                d.max_symbols_per_session,
            )?,
            breaker_failure_threshold: env_u32(
                "CANDELA_BREAKER_FAILURE_THRESHOLD",
                d.breaker_failure_threshold,
            )?,
            breaker_recovery_timeout: env_secs(
                "CANDELA_BREAKER_RECOVERY_TIMEOUT",
                d.breaker_recovery_timeout,
            )?,
            breaker_half_open_max_calls: env_u32(
                "CANDELA_BREAKER_HALF_OPEN_MAX_CALLS",
                d.breaker_half_open_max_calls,
            )?,
            closed_queue_max: env_usize("CANDELA_CLOSED_QUEUE_MAX", d.closed_queue_max)?,
            open_queue_max,
            dedup_window: env_secs("CANDELA_DEDUP_WINDOW_SECONDS", d.dedup_window)?,
            dedup_max_entries: env_usize("CANDELA_DEDUP_MAX_ENTRIES", d.dedup_max_entries)?,
            rest_pool_connections: env_usize(
                "CANDELA_REST_POOL_CONNECTIONS",
                d.rest_pool_connections,
            )?,
            rest_pool_maxsize: env_usize("CANDELA_REST_POOL_MAXSIZE", d.rest_pool_maxsize)?,
            default_interval: env_string("CANDELA_DEFAULT_INTERVAL", &d.default_interval),
            router_queue_max: env_usize("CANDELA_ROUTER_QUEUE_MAX", d.router_queue_max)?,
            max_sessions_per_venue: env_usize(
                "CANDELA_MAX_SESSIONS_PER_VENUE",
                d.max_sessions_per_venue,
            )?,
        };

        let s = ServerSettings::default();
        let server = ServerSettings {
            host: env_string("CANDELA_WSS_HOST", &s.host),
            port: env_u16("CANDELA_WSS_PORT", s.port)?,
            subscribe_timeout: env_secs("CANDELA_WSS_SUBSCRIBE_TIMEOUT", s.subscribe_timeout)?,
            health_check_port: env_u16("CANDELA_HEALTH_CHECK_PORT", s.health_check_port)?,
            health_check_enabled: env_bool("CANDELA_HEALTH_CHECK_ENABLED", s.health_check_enabled),
        };

        Ok(Self { connector, server })
    }
}
