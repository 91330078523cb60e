use crate::concurrency::{CircuitStatus, FallbackReason};
use crate::cost::{RateLimitExceeded, UsageStats};
use crate::security::EntityType;
use crate::session::SessionStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// What a successful `send` hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Session the exchange was recorded in
    pub session_id: String,
    /// Reply text, either from the LLM or synthesized locally
    pub content: String,
    /// The user's text as it was sent and stored, placeholders included
    pub sanitized_input: String,
    /// Whether `content` came from the local fallback
    pub is_fallback: bool,
    /// Why the fallback was served, when it was
    pub fallback_reason: Option<FallbackReason>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    /// Wall-clock time spent in the LLM call, zero when short-circuited
    pub latency: Duration,
}

fn describe_entities(entities: &[EntityType]) -> String {
    entities
        .iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reasons `send` returns no reply. A blocked or rate-limited message never
/// touches the session or the usage window.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(
        "message blocked: it contains personal information ({}); please remove it and try again",
        describe_entities(.entities)
    )]
    SanitizationBlocked { entities: Vec<EntityType> },

    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitExceeded),

    /// The exchange task was cancelled, e.g. by runtime shutdown. The call
    /// was already counted against the user.
    #[error("exchange interrupted: {0}")]
    Interrupted(String),
}

impl PipelineError {
    /// How long the caller should wait before retrying, if waiting helps.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::SanitizationBlocked { .. } | PipelineError::Interrupted(_) => None,
            PipelineError::RateLimited(e) => Some(e.retry_after),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub sent: AtomicU64,
    pub blocked: AtomicU64,
    pub rate_limited: AtomicU64,
    pub completed: AtomicU64,
    pub fallbacks: AtomicU64,
}

impl PipelineCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            sent: self.sent.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Lifetime counters for one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStats {
    /// Every call to `send`
    pub sent: u64,
    /// Refused by the privacy filter
    pub blocked: u64,
    /// Refused by the rate limiter
    pub rate_limited: u64,
    /// Answered by the LLM
    pub completed: u64,
    /// Answered by the local fallback
    pub fallbacks: u64,
}

/// Aggregated health view for dashboards and the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub provider: String,
    pub pipeline: PipelineStats,
    pub circuit: CircuitStatus,
    pub usage: UsageStats,
    pub sessions: SessionStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::LimitScope;

    #[test]
    fn blocked_error_names_kinds_only() {
        let err = PipelineError::SanitizationBlocked {
            entities: vec![EntityType::Email, EntityType::Phone],
        };
        let msg = err.to_string();
        assert!(msg.contains("email, phone"));
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn rate_limited_error_exposes_wait() {
        let err = PipelineError::from(RateLimitExceeded {
            scope: LimitScope::UserCalls,
            limit: 5.0,
            current: 5.0,
            retry_after: Duration::from_secs(42),
        });
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert!(err.to_string().starts_with("rate limited: per-user call limit"));
    }

    #[test]
    fn counters_snapshot() {
        let counters = PipelineCounters::default();
        PipelineCounters::bump(&counters.sent);
        PipelineCounters::bump(&counters.sent);
        PipelineCounters::bump(&counters.fallbacks);
        let stats = counters.snapshot();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.completed, 0);
    }
}
