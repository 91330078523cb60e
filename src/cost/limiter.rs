use super::types::{LimitScope, RateLimitExceeded, UsageRecord, UsageStats, UserUsageStats};
use super::window::{UsageEntry, UsageWindow};
use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Records between sweeps of idle per-user windows.
const COMPACT_EVERY: u32 = 256;

/// Admission control over a rolling window.
///
/// Three independent, optional ceilings: global calls, per-user calls and
/// global cost. [`RateLimiter::check`] never mutates. [`RateLimiter::reserve`]
/// admits and counts a call under one lock, and [`RateLimiter::settle`] fills
/// in its cost later.
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    capacity: usize,
    inner: Mutex<LimiterState>,
}

struct LimiterState {
    global: UsageWindow,
    users: HashMap<String, UsageWindow>,
    records_since_compaction: u32,
    next_seq: u64,
}

/// An admitted call whose cost is not known yet. Hand it back to
/// [`RateLimiter::settle`] once the call finishes.
#[derive(Debug)]
#[must_use = "an unsettled reservation counts as a zero-cost call"]
pub struct Reservation {
    user_id: String,
    seq: u64,
}

impl Reservation {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let window = config.window();
        // Never let the storage bound undercount a configured ceiling.
        let capacity = [
            config.max_calls_per_hour.unwrap_or(0) as usize,
            config.max_calls_per_user_per_hour.unwrap_or(0) as usize,
        ]
        .into_iter()
        .fold(config.max_entries.max(1), usize::max);

        Self {
            config,
            window,
            capacity,
            inner: Mutex::new(LimiterState {
                global: UsageWindow::new(capacity),
                users: HashMap::new(),
                records_since_compaction: 0,
                next_seq: 0,
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Would one more call from `user_id` stay within every ceiling?
    pub fn check(&self, user_id: &str) -> Result<(), RateLimitExceeded> {
        let inner = self.inner.lock();
        self.check_locked(&inner, user_id, Instant::now())
    }

    fn check_locked(
        &self,
        inner: &LimiterState,
        user_id: &str,
        now: Instant,
    ) -> Result<(), RateLimitExceeded> {
        if let Some(limit) = self.config.max_calls_per_hour {
            let limit = limit as usize;
            let current = inner.global.call_count(now, self.window);
            if current >= limit {
                return Err(RateLimitExceeded {
                    scope: LimitScope::GlobalCalls,
                    limit: limit as f64,
                    current: current as f64,
                    retry_after: inner.global.retry_after_calls(now, self.window, limit),
                });
            }
        }

        if let Some(limit) = self.config.max_calls_per_user_per_hour {
            let limit = limit as usize;
            let user = inner.users.get(user_id);
            let current = user.map_or(0, |w| w.call_count(now, self.window));
            if current >= limit {
                let retry_after = user.map_or(self.window, |w| {
                    w.retry_after_calls(now, self.window, limit)
                });
                return Err(RateLimitExceeded {
                    scope: LimitScope::UserCalls,
                    limit: limit as f64,
                    current: current as f64,
                    retry_after,
                });
            }
        }

        if let Some(limit) = self.config.max_cost_per_hour_usd {
            let current = inner.global.cost(now, self.window);
            if current >= limit {
                return Err(RateLimitExceeded {
                    scope: LimitScope::GlobalCost,
                    limit,
                    current,
                    retry_after: inner.global.retry_after_cost(now, self.window, limit),
                });
            }
        }

        Ok(())
    }

    pub fn admit(&self, user_id: &str) -> bool {
        self.check(user_id).is_ok()
    }

    /// Record one call with its cost. Zero-cost calls still count.
    pub fn record(&self, user_id: &str, cost_usd: f64) {
        self.record_usage(user_id, UsageRecord::with_cost(cost_usd));
    }

    pub fn record_usage(&self, user_id: &str, usage: UsageRecord) {
        let cost_usd = valid_cost(user_id, usage.cost_usd);
        let mut inner = self.inner.lock();
        let entry = UsageEntry {
            seq: inner.take_seq(),
            at: Instant::now(),
            cost_usd,
            tokens: usage.tokens,
            latency: usage.latency,
            pending: false,
        };
        self.push_locked(&mut inner, user_id, entry);
    }

    /// Check every ceiling and, if admitted, count the call immediately with
    /// zero cost. Nothing is recorded on rejection.
    pub fn reserve(&self, user_id: &str) -> Result<Reservation, RateLimitExceeded> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.check_locked(&inner, user_id, now)?;
        let seq = inner.take_seq();
        let entry = UsageEntry {
            seq,
            at: now,
            cost_usd: 0.0,
            tokens: 0,
            latency: Duration::ZERO,
            pending: true,
        };
        self.push_locked(&mut inner, user_id, entry);
        Ok(Reservation {
            user_id: user_id.to_string(),
            seq,
        })
    }

    /// Attach the real usage to a reserved call without counting it again.
    pub fn settle(&self, reservation: Reservation, usage: UsageRecord) {
        let user_id = reservation.user_id.as_str();
        let cost_usd = valid_cost(user_id, usage.cost_usd);
        let mut inner = self.inner.lock();
        let global = inner
            .global
            .settle(reservation.seq, cost_usd, usage.tokens, usage.latency);
        let user = inner
            .users
            .get_mut(user_id)
            .is_some_and(|w| w.settle(reservation.seq, cost_usd, usage.tokens, usage.latency));
        if !(global && user) {
            debug!(user_id, cost_usd, "Reservation left the window before settling");
        }
    }

    fn push_locked(&self, inner: &mut LimiterState, user_id: &str, entry: UsageEntry) {
        inner.global.push(entry, self.window);
        let capacity = self.capacity;
        inner
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UsageWindow::new(capacity))
            .push(entry, self.window);

        inner.records_since_compaction += 1;
        if inner.records_since_compaction >= COMPACT_EVERY {
            Self::compact_locked(inner, entry.at, self.window);
        }
    }

    /// Drop per-user windows with no live entries.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        Self::compact_locked(&mut inner, Instant::now(), self.window);
    }

    fn compact_locked(inner: &mut LimiterState, now: Instant, window: Duration) {
        let before = inner.users.len();
        inner.users.retain(|_, w| {
            w.prune(now, window);
            !w.is_idle(now, window)
        });
        inner.global.prune(now, window);
        inner.records_since_compaction = 0;
        let dropped = before - inner.users.len();
        if dropped > 0 {
            debug!(dropped, "Compacted idle rate-limit windows");
        }
    }

    pub fn stats(&self) -> UsageStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        let summary = inner.global.summary(now, self.window);
        let active_users = inner
            .users
            .values()
            .filter(|w| !w.is_idle(now, self.window))
            .count();

        UsageStats {
            window: self.window,
            total_calls: summary.calls,
            total_cost_usd: summary.cost_usd,
            total_tokens: summary.tokens,
            average_latency: summary.average_latency,
            remaining_calls: self
                .config
                .max_calls_per_hour
                .map(|limit| (limit as usize).saturating_sub(summary.calls)),
            remaining_cost_usd: self
                .config
                .max_cost_per_hour_usd
                .map(|limit| (limit - summary.cost_usd).max(0.0)),
            active_users,
        }
    }

    pub fn user_stats(&self, user_id: &str) -> UserUsageStats {
        let now = Instant::now();
        let inner = self.inner.lock();
        let summary = inner
            .users
            .get(user_id)
            .map(|w| w.summary(now, self.window))
            .unwrap_or_default();

        UserUsageStats {
            user_id: user_id.to_string(),
            calls: summary.calls,
            cost_usd: summary.cost_usd,
            tokens: summary.tokens,
            average_latency: summary.average_latency,
            remaining_calls: self
                .config
                .max_calls_per_user_per_hour
                .map(|limit| (limit as usize).saturating_sub(summary.calls)),
        }
    }

    /// Forget all recorded usage.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.global.clear();
        inner.users.clear();
        inner.records_since_compaction = 0;
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.inner.lock().users.len()
    }
}

impl LimiterState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }
}

fn valid_cost(user_id: &str, cost_usd: f64) -> f64 {
    if cost_usd.is_finite() && cost_usd >= 0.0 {
        cost_usd
    } else {
        warn!(user_id, cost = cost_usd, "Ignoring invalid call cost");
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(global: Option<u32>, per_user: Option<u32>, cost: Option<f64>) -> RateLimitConfig {
        RateLimitConfig {
            max_calls_per_hour: global,
            max_calls_per_user_per_hour: per_user,
            max_cost_per_hour_usd: cost,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn per_user_ceiling_rejects_next_call_only_for_that_user() {
        let limiter = RateLimiter::new(limits(None, Some(3), None));
        for _ in 0..3 {
            assert!(limiter.admit("alice"));
            limiter.record("alice", 0.01);
        }

        let err = limiter.check("alice").unwrap_err();
        assert_eq!(err.scope, LimitScope::UserCalls);
        assert!((err.current - 3.0).abs() < f64::EPSILON);
        assert!(limiter.admit("bob"));
    }

    #[tokio::test]
    async fn admit_does_not_mutate() {
        let limiter = RateLimiter::new(limits(Some(1), None, None));
        for _ in 0..10 {
            assert!(limiter.admit("alice"));
        }
        assert_eq!(limiter.stats().total_calls, 0);
    }

    #[tokio::test]
    async fn global_call_ceiling_spans_users() {
        let limiter = RateLimiter::new(limits(Some(2), None, None));
        limiter.record("alice", 0.0);
        limiter.record("bob", 0.0);

        let err = limiter.check("carol").unwrap_err();
        assert_eq!(err.scope, LimitScope::GlobalCalls);
    }

    #[tokio::test]
    async fn cost_ceiling_ignores_zero_cost_calls() {
        let limiter = RateLimiter::new(limits(None, None, Some(1.0)));
        for _ in 0..50 {
            limiter.record("alice", 0.0);
        }
        assert!(limiter.admit("alice"));

        limiter.record("alice", 0.5);
        assert!(limiter.admit("alice"));
        limiter.record("alice", 0.5);

        let err = limiter.check("alice").unwrap_err();
        assert_eq!(err.scope, LimitScope::GlobalCost);
        assert_eq!(limiter.stats().total_calls, 52);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_readmits_without_sweep() {
        let limiter = RateLimiter::new(limits(None, Some(1), None));
        limiter.record("alice", 0.0);
        assert!(!limiter.admit("alice"));

        let err = limiter.check("alice").unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(3600));

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(!limiter.admit("alice"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit("alice"));
    }

    #[tokio::test]
    async fn invalid_costs_are_recorded_as_zero() {
        let limiter = RateLimiter::new(RateLimitConfig::unlimited());
        limiter.record("alice", f64::NAN);
        limiter.record("alice", -1.0);
        let stats = limiter.stats();
        assert_eq!(stats.total_calls, 2);
        assert!(stats.total_cost_usd.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_report_remaining_budget_and_averages() {
        let limiter = RateLimiter::new(limits(Some(10), Some(5), Some(2.0)));
        limiter.record_usage(
            "alice",
            UsageRecord {
                cost_usd: 0.5,
                tokens: 100,
                latency: Duration::from_millis(200),
            },
        );
        limiter.record_usage(
            "bob",
            UsageRecord {
                cost_usd: 0.25,
                tokens: 50,
                latency: Duration::from_millis(400),
            },
        );

        let stats = limiter.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_tokens, 150);
        assert_eq!(stats.remaining_calls, Some(8));
        assert!((stats.remaining_cost_usd.unwrap() - 1.25).abs() < 1e-9);
        assert_eq!(stats.average_latency, Duration::from_millis(300));
        assert_eq!(stats.active_users, 2);

        let alice = limiter.user_stats("alice");
        assert_eq!(alice.calls, 1);
        assert_eq!(alice.tokens, 100);
        assert_eq!(alice.remaining_calls, Some(4));

        let nobody = limiter.user_stats("nobody");
        assert_eq!(nobody.calls, 0);
        assert_eq!(nobody.remaining_calls, Some(5));
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let limiter = RateLimiter::new(limits(Some(1), None, None));
        limiter.record("alice", 1.0);
        assert!(!limiter.admit("alice"));
        limiter.reset();
        assert!(limiter.admit("alice"));
        assert_eq!(limiter.stats().total_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_user_windows_are_compacted() {
        let limiter = RateLimiter::new(RateLimitConfig::unlimited());
        for i in 0..10 {
            limiter.record(&format!("user-{i}"), 0.0);
        }
        assert_eq!(limiter.tracked_users(), 10);

        tokio::time::advance(Duration::from_secs(3600)).await;
        limiter.record("fresh", 0.0);
        limiter.compact();
        assert_eq!(limiter.tracked_users(), 1);
    }

    #[tokio::test]
    async fn concurrent_records_are_all_counted() {
        let limiter = std::sync::Arc::new(RateLimiter::new(RateLimitConfig::unlimited()));
        let mut handles = Vec::new();
        for t in 0..8 {
            let limiter = std::sync::Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    limiter.record(&format!("user-{t}"), 0.001);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(limiter.stats().total_calls, 200);
        assert_eq!(limiter.user_stats("user-3").calls, 25);
    }

    #[tokio::test]
    async fn reserve_counts_the_call_before_it_finishes() {
        let limiter = RateLimiter::new(limits(None, Some(1), None));
        let reservation = limiter.reserve("alice").unwrap();
        assert_eq!(reservation.user_id(), "alice");

        let err = limiter.reserve("alice").unwrap_err();
        assert_eq!(err.scope, LimitScope::UserCalls);
        assert_eq!(limiter.user_stats("alice").calls, 1);
        assert!(limiter.user_stats("alice").cost_usd.abs() < f64::EPSILON);

        limiter.settle(
            reservation,
            UsageRecord {
                cost_usd: 0.02,
                tokens: 30,
                latency: Duration::from_millis(150),
            },
        );
        let alice = limiter.user_stats("alice");
        assert_eq!(alice.calls, 1, "settling never adds a call");
        assert_eq!(alice.tokens, 30);
        assert!((alice.cost_usd - 0.02).abs() < 1e-9);
        assert_eq!(limiter.stats().average_latency, Duration::from_millis(150));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_overshoot() {
        let limiter = std::sync::Arc::new(RateLimiter::new(limits(Some(10), None, None)));
        let mut handles = Vec::new();
        for t in 0..8 {
            let limiter = std::sync::Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                (0..10)
                    .filter(|_| limiter.reserve(&format!("user-{t}")).is_ok())
                    .count()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, 10);
        assert_eq!(limiter.stats().total_calls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn settling_an_expired_reservation_is_harmless() {
        let limiter = RateLimiter::new(RateLimitConfig::unlimited());
        let reservation = limiter.reserve("alice").unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        limiter.record("alice", 0.0);
        limiter.settle(reservation, UsageRecord::with_cost(5.0));

        let stats = limiter.stats();
        assert_eq!(stats.total_calls, 1);
        assert!(stats.total_cost_usd.abs() < f64::EPSILON);
    }
}
