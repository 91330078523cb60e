//! Circuit breaker guarding the outbound LLM call.
//!
//! Three states:
//! - `Closed`: calls pass through, consecutive failures are counted
//! - `Open`: calls are not attempted, the fallback is returned immediately
//! - `HalfOpen`: a bounded number of trial calls probe the dependency
//!
//! All state lives behind one mutex so transitions are atomic relative to
//! concurrent [`CircuitBreaker::execute`] calls. When the cool-down expires,
//! exactly one caller performs the `Open -> HalfOpen` transition and takes the
//! trial slot; everyone else keeps getting the fallback until the trial
//! settles.

use crate::config::CircuitConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Why `execute` answered with the fallback instead of the operation's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// Breaker open, operation not attempted
    Open,
    /// Half-open and every trial slot is taken
    HalfOpenBusy,
    /// Operation ran and failed
    Failed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::Open => write!(f, "circuit open"),
            FallbackReason::HalfOpenBusy => write!(f, "circuit half-open, trial in progress"),
            FallbackReason::Failed(msg) => write!(f, "call failed: {msg}"),
        }
    }
}

/// Tagged result of [`CircuitBreaker::execute`]. Never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitOutcome<T> {
    Success(T),
    Fallback { value: T, reason: FallbackReason },
}

impl<T> CircuitOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, CircuitOutcome::Fallback { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            CircuitOutcome::Success(value) | CircuitOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            CircuitOutcome::Success(value) | CircuitOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn reason(&self) -> Option<&FallbackReason> {
        match self {
            CircuitOutcome::Success(_) => None,
            CircuitOutcome::Fallback { reason, .. } => Some(reason),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Only meaningful while half-open
    pub consecutive_successes: u32,
    /// Remaining cool-down while open
    pub time_until_retry: Option<Duration>,
    pub time_in_current_state: Duration,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_state_change: Instant,
    trials_in_flight: u32,
    /// Bumped on every transition; outcomes from an older generation are stale.
    generation: u64,
    total_calls: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_state_change: Instant::now(),
            trials_in_flight: 0,
            generation: 0,
            total_calls: 0,
            total_failures: 0,
            total_rejected: 0,
        }
    }
}

type Transition = (CircuitState, CircuitState);
type StateChangeHandler = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
    handlers: Mutex<Vec<StateChangeHandler>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_name("default", config)
    }

    pub fn with_name(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` under breaker protection.
    ///
    /// An `Err` from the operation counts as a failure and yields
    /// `fallback()`. Callers wanting a deadline wrap the operation in
    /// `tokio::time::timeout` and map the elapsed error into `Err`. If the
    /// returned future is dropped mid-call, a held trial slot is released
    /// without recording an outcome.
    pub async fn execute<T, E, Op, Fut, Fb>(&self, operation: Op, fallback: Fb) -> CircuitOutcome<T>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        Fb: FnOnce() -> T,
    {
        let permit = match self.acquire() {
            Ok(permit) => permit,
            Err(reason) => {
                debug!(breaker = %self.name, %reason, "Call short-circuited");
                return CircuitOutcome::Fallback {
                    value: fallback(),
                    reason,
                };
            }
        };

        match operation().await {
            Ok(value) => {
                permit.succeed();
                CircuitOutcome::Success(value)
            }
            Err(e) => {
                let message = e.to_string();
                permit.fail();
                CircuitOutcome::Fallback {
                    value: fallback(),
                    reason: FallbackReason::Failed(message),
                }
            }
        }
    }

    /// Register a callback fired after every state transition.
    ///
    /// Handlers run outside the state lock but must not register further
    /// handlers.
    pub fn on_state_change<F>(&self, handler: F)
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.handlers.lock().push(Box::new(handler));
    }

    pub fn force_open(&self) {
        warn!(breaker = %self.name, "Circuit breaker manually opened");
        let change = {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Open)
        };
        self.notify(change);
    }

    pub fn force_close(&self) {
        info!(breaker = %self.name, "Circuit breaker manually closed");
        let change = {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Closed)
        };
        self.notify(change);
    }

    /// Back to `Closed` with all counters and totals cleared.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let change = self.transition(&mut inner, CircuitState::Closed);
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.total_calls = 0;
            inner.total_failures = 0;
            inner.total_rejected = 0;
            change
        };
        self.notify(change);
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        let now = Instant::now();
        let time_until_retry = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                (opened_at + self.config.open_timeout()).saturating_duration_since(now),
            ),
            _ => None,
        };

        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            time_until_retry,
            time_in_current_state: now.saturating_duration_since(inner.last_state_change),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
        }
    }

    fn acquire(&self) -> Result<CallPermit<'_>, FallbackReason> {
        let mut change = None;
        let result = {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_timeout());
                if cooled_down {
                    change = self.transition(&mut inner, CircuitState::HalfOpen);
                }
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.total_calls += 1;
                    Ok(CallPermit::new(self, inner.generation, false))
                }
                CircuitState::Open => {
                    inner.total_rejected += 1;
                    Err(FallbackReason::Open)
                }
                CircuitState::HalfOpen => {
                    if inner.trials_in_flight < self.config.half_open_max_calls.max(1) {
                        inner.trials_in_flight += 1;
                        inner.total_calls += 1;
                        Ok(CallPermit::new(self, inner.generation, true))
                    } else {
                        inner.total_rejected += 1;
                        Err(FallbackReason::HalfOpenBusy)
                    }
                }
            }
        };
        self.notify(change);
        result
    }

    fn record_success(&self, generation: u64, trial: bool) {
        let change = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    if trial {
                        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                    }
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        info!(
                            breaker = %self.name,
                            successes = inner.consecutive_successes,
                            "Circuit breaker recovered"
                        );
                        self.transition(&mut inner, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    fn record_failure(&self, generation: u64) {
        let change = {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            if inner.generation != generation {
                return;
            }
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        error!(
                            breaker = %self.name,
                            failures = inner.consecutive_failures,
                            "Circuit breaker tripped"
                        );
                        self.transition(&mut inner, CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    warn!(breaker = %self.name, "Trial call failed, re-opening circuit");
                    self.transition(&mut inner, CircuitState::Open)
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    /// Apply a transition under the caller's lock. Returns the change to
    /// announce once the lock is released.
    fn transition(&self, inner: &mut BreakerState, to: CircuitState) -> Option<Transition> {
        let now = Instant::now();
        match to {
            CircuitState::Open => inner.opened_at = Some(now),
            CircuitState::Closed => inner.opened_at = None,
            CircuitState::HalfOpen => {}
        }

        let from = inner.state;
        if from == to {
            return None;
        }

        inner.state = to;
        inner.generation += 1;
        inner.last_state_change = now;
        inner.trials_in_flight = 0;
        inner.consecutive_successes = 0;
        if to == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }

        info!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
        Some((from, to))
    }

    fn notify(&self, change: Option<Transition>) {
        if let Some((from, to)) = change {
            for handler in self.handlers.lock().iter() {
                handler(from, to);
            }
        }
    }
}

/// Admission ticket for one call. Dropping it unsettled (cancellation)
/// frees a held trial slot and records nothing.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation, self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.generation);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}
