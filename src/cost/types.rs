use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Usage attributed to one completed LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub cost_usd: f64,
    pub tokens: u64,
    pub latency: Duration,
}

impl UsageRecord {
    pub fn with_cost(cost_usd: f64) -> Self {
        Self {
            cost_usd,
            ..Self::default()
        }
    }
}

/// Which ceiling rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    GlobalCalls,
    UserCalls,
    GlobalCost,
}

impl LimitScope {
    /// Stable key for events and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            LimitScope::GlobalCalls => "global_calls",
            LimitScope::UserCalls => "user_calls",
            LimitScope::GlobalCost => "global_cost",
        }
    }
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::GlobalCalls => write!(f, "global call"),
            LimitScope::UserCalls => write!(f, "per-user call"),
            LimitScope::GlobalCost => write!(f, "global cost"),
        }
    }
}

/// Admission refused. Carries enough context for the caller to tell the
/// user how long to wait.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{scope} limit reached ({current}/{limit}), retry after {}s", .retry_after.as_secs())]
pub struct RateLimitExceeded {
    pub scope: LimitScope,
    pub limit: f64,
    pub current: f64,
    pub retry_after: Duration,
}

/// Global view over the live window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub window: Duration,
    pub total_calls: usize,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub average_latency: Duration,
    /// `None` when the ceiling is not configured
    pub remaining_calls: Option<usize>,
    pub remaining_cost_usd: Option<f64>,
    pub active_users: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserUsageStats {
    pub user_id: String,
    pub calls: usize,
    pub cost_usd: f64,
    pub tokens: u64,
    pub average_latency: Duration,
    pub remaining_calls: Option<usize>,
}
