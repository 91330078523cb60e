use std::time::Duration;

use crate::concurrency::CircuitState;

/// Discrete events emitted by the conversation engine for observability.
///
/// Events carry just enough context for tracing and diagnostics. They never
/// carry message content: sanitization events report entity kinds only.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A sanitized message is about to be sent to the LLM provider.
    LlmRequest {
        provider: String,
        session_id: String,
        history_len: usize,
    },
    /// Result of a single LLM provider call.
    LlmResponse {
        provider: String,
        duration: Duration,
        success: bool,
        error_message: Option<String>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// An outbound message carried critical personal data and was stopped.
    SanitizationBlocked {
        session_id: String,
        /// Entity kinds (e.g. `"email"`) that made the text unsafe.
        entities: Vec<String>,
    },
    /// A message was refused admission by the rate limiter.
    RateLimited {
        user_id: String,
        /// Which ceiling was hit (`"global_calls"`, `"user_calls"`, `"global_cost"`).
        scope: String,
        retry_after: Duration,
    },
    /// The shared circuit breaker moved between states.
    CircuitStateChanged {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A locally synthesized reply was returned instead of an LLM reply.
    FallbackServed { session_id: String, reason: String },
    /// A session crossed a capacity threshold (percentage of `max_messages`).
    SessionCapacity {
        session_id: String,
        percent: u8,
        message_count: usize,
    },
    /// Old messages were evicted from a session.
    SessionTrimmed {
        session_id: String,
        evicted: usize,
        byte_usage: usize,
    },
    /// Idle sessions were removed by the reaper.
    SessionsReaped { count: usize },
    /// An error occurred in a named component.
    Error {
        /// Subsystem where the error originated (e.g., `"persistence"`, `"provider"`).
        component: String,
        /// Human-readable error description. Must not contain user text or secrets.
        message: String,
    },
}

/// Numeric metrics emitted by the conversation engine.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Time elapsed for a single LLM request.
    RequestLatency(Duration),
    /// Number of tokens consumed by an LLM call.
    TokensUsed(u64),
    /// Current number of live sessions in the store.
    ActiveSessions(u64),
}

/// Core observability trait for recording engine telemetry.
///
/// The pipeline, session store and circuit breaker hold an `Arc<dyn Observer>`
/// and call [`record_event`](Observer::record_event) and
/// [`record_metric`](Observer::record_metric) at key lifecycle points.
///
/// Implementations must be `Send + Sync + 'static` because the observer is
/// shared across async tasks via `Arc`.
pub trait Observer: Send + Sync + 'static {
    /// Record a discrete lifecycle event.
    ///
    /// Called synchronously on the hot path; implementations should avoid
    /// blocking I/O.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered telemetry data to the backend. Called once at
    /// shutdown.
    fn flush(&self) {}

    /// Return the human-readable name of this observer backend.
    fn name(&self) -> &str;
}
