//! Circuit breaker guarding reconnection attempts.

use std::time::{Duration, Instant};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; every call is admitted.
    Closed,
    /// Failures exceeded the threshold; calls are blocked until the backoff
    /// window elapses.
    Open,
    /// Probing whether the venue recovered; a limited number of calls pass.
    HalfOpen,
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed.
    Allowed,
    /// The call is blocked; wait roughly this long before asking again.
    Wait(Duration),
}

/// Circuit breaker with exponential backoff between open cycles.
///
/// Owned and driven by a single engine task; no interior locking. The
/// lifecycle is Closed → Open (after `failure_threshold` consecutive
/// failures) → HalfOpen (after the backoff window) → Closed on a successful
/// probe or back to Open on a failed one, doubling the backoff up to its cap
/// each consecutive open cycle.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    base_recovery: Duration,
    half_open_max_calls: u32,
    backoff_multiplier: f64,
    max_backoff: Duration,

    state: BreakerState,
    failures: u32,
    half_open_calls: u32,
    consecutive_open_cycles: u32,
    last_failure_at: Option<Instant>,
}

const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

impl CircuitBreaker {
    /// Create a breaker.
    ///
    /// `failure_threshold` consecutive failures open the circuit;
    /// `base_recovery` is the first open window; `half_open_max_calls` bounds
    /// probes per half-open phase. The backoff multiplier (2.0) and cap
    /// (300 s) follow the upstream defaults.
    #[must_use]
    pub fn new(failure_threshold: u32, base_recovery: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            base_recovery,
            half_open_max_calls: half_open_max_calls.max(1),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: DEFAULT_MAX_BACKOFF,
            state: BreakerState::Closed,
            failures: 0,
            half_open_calls: 0,
            consecutive_open_cycles: 0,
            last_failure_at: None,
        }
    }

    /// Override the backoff cap. Primarily for tests and aggressive configs.
    #[must_use]
    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> BreakerState {
        self.state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failures
    }

    /// Backoff for the current consecutive-open-cycle count:
    /// `base` for the first cycle, then `base * multiplier^(k-1)` capped.
    #[must_use]
    pub fn current_backoff(&self) -> Duration {
        if self.consecutive_open_cycles <= 1 {
            return self.base_recovery.min(self.max_backoff);
        }
        let exponent = i32::try_from(self.consecutive_open_cycles - 1).unwrap_or(i32::MAX);
        let secs = self.base_recovery.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_backoff
        }
    }

    /// Whether the backoff schedule has saturated at its cap: the breaker's
    /// retry budget is spent and the owning session should give up rather
    /// than keep waiting.
    #[must_use]
    pub fn budget_exhausted(&self) -> bool {
        self.consecutive_open_cycles > 0 && self.current_backoff() >= self.max_backoff
    }

    /// Ask for admission.
    ///
    /// In `Open`, transitions to `HalfOpen` once the backoff window has
    /// elapsed since the last failure; otherwise returns the remaining wait.
    /// In `HalfOpen`, admits up to the probe budget and then returns the full
    /// backoff as the hint.
    pub fn admit(&mut self) -> Admission {
        if self.state == BreakerState::Open {
            let backoff = self.current_backoff();
            let elapsed = self
                .last_failure_at
                .map_or(backoff, |at| at.elapsed().min(backoff));
            if elapsed >= backoff {
                tracing::info!(
                    backoff_secs = backoff.as_secs_f64(),
                    open_cycles = self.consecutive_open_cycles,
                    "circuit breaker entering half-open state"
                );
                self.state = BreakerState::HalfOpen;
                self.half_open_calls = 0;
            } else {
                return Admission::Wait(backoff - elapsed);
            }
        }

        if self.state == BreakerState::HalfOpen {
            if self.half_open_calls >= self.half_open_max_calls {
                return Admission::Wait(self.current_backoff());
            }
            self.half_open_calls += 1;
        }

        Admission::Allowed
    }

    /// Record a successful call.
    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                tracing::info!(
                    open_cycles = self.consecutive_open_cycles,
                    "circuit breaker probe succeeded, closing circuit"
                );
                self.state = BreakerState::Closed;
                self.failures = 0;
                self.half_open_calls = 0;
                self.consecutive_open_cycles = 0;
                self.last_failure_at = None;
            }
            BreakerState::Closed => {
                self.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn on_failure(&mut self) {
        self.failures += 1;
        self.last_failure_at = Some(Instant::now());

        match self.state {
            BreakerState::HalfOpen => {
                self.consecutive_open_cycles += 1;
                self.state = BreakerState::Open;
                self.half_open_calls = 0;
                tracing::warn!(
                    open_cycles = self.consecutive_open_cycles,
                    next_backoff_secs = self.current_backoff().as_secs_f64(),
                    "circuit breaker probe failed, reopening circuit"
                );
            }
            BreakerState::Closed => {
                if self.failures >= self.failure_threshold {
                    self.consecutive_open_cycles += 1;
                    self.state = BreakerState::Open;
                    tracing::warn!(
                        failures = self.failures,
                        backoff_secs = self.current_backoff().as_secs_f64(),
                        "circuit breaker opening"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}
