use super::traits::{Observer, ObserverEvent, ObserverMetric};
use std::io::Write;
use tracing::{info, warn};

/// Observer that writes every event and metric through `tracing`.
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::LlmRequest {
                provider,
                session_id,
                history_len,
            } => {
                info!(
                    provider = %provider,
                    session = %session_id,
                    history_len = history_len,
                    "llm.request"
                );
            }
            ObserverEvent::LlmResponse {
                provider,
                duration,
                success,
                error_message,
                input_tokens,
                output_tokens,
            } => {
                info!(
                    provider = %provider,
                    duration_ms = millis(*duration),
                    success = success,
                    error = ?error_message,
                    input_tokens = ?input_tokens,
                    output_tokens = ?output_tokens,
                    "llm.response"
                );
            }
            ObserverEvent::SanitizationBlocked {
                session_id,
                entities,
            } => {
                warn!(session = %session_id, entities = ?entities, "sanitize.blocked");
            }
            ObserverEvent::RateLimited {
                user_id,
                scope,
                retry_after,
            } => {
                warn!(
                    user = %user_id,
                    scope = %scope,
                    retry_after_ms = millis(*retry_after),
                    "rate.limited"
                );
            }
            ObserverEvent::CircuitStateChanged { breaker, from, to } => {
                info!(breaker = %breaker, from = %from, to = %to, "circuit.transition");
            }
            ObserverEvent::FallbackServed { session_id, reason } => {
                info!(session = %session_id, reason = %reason, "fallback.served");
            }
            ObserverEvent::SessionCapacity {
                session_id,
                percent,
                message_count,
            } => {
                warn!(
                    session = %session_id,
                    percent = percent,
                    messages = message_count,
                    "session.capacity"
                );
            }
            ObserverEvent::SessionTrimmed {
                session_id,
                evicted,
                byte_usage,
            } => {
                info!(
                    session = %session_id,
                    evicted = evicted,
                    bytes = byte_usage,
                    "session.trimmed"
                );
            }
            ObserverEvent::SessionsReaped { count } => {
                info!(count = count, "session.reaped");
            }
            ObserverEvent::Error { component, message } => {
                warn!(component = %component, error = %message, "error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::RequestLatency(d) => {
                info!(latency_ms = millis(*d), "metric.request_latency");
            }
            ObserverMetric::TokensUsed(t) => {
                info!(tokens = t, "metric.tokens_used");
            }
            ObserverMetric::ActiveSessions(s) => {
                info!(sessions = s, "metric.active_sessions");
            }
        }
    }

    /// The fmt subscriber writes to stdout.
    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }

    fn name(&self) -> &str {
        "log"
    }
}
