//! Rolling usage window.
//!
//! Entries are appended in time order. Anything at least `window` old is
//! logically expired: reads skip it without mutating, and the next
//! [`UsageWindow::push`] drops it. A hard `capacity` bounds memory under
//! sustained load.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct UsageEntry {
    /// Limiter-assigned id, used to settle a reservation in place.
    pub seq: u64,
    pub at: Instant,
    pub cost_usd: f64,
    pub tokens: u64,
    pub latency: Duration,
    /// Admitted but not yet settled; counts as a call with no cost so far.
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct WindowSummary {
    pub calls: usize,
    pub cost_usd: f64,
    pub tokens: u64,
    pub average_latency: Duration,
}

#[derive(Debug)]
pub(crate) struct UsageWindow {
    entries: VecDeque<UsageEntry>,
    capacity: usize,
}

impl UsageWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: UsageEntry, window: Duration) {
        self.prune(entry.at, window);
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .entries
            .front()
            .is_some_and(|e| !is_live(e, now, window))
        {
            self.entries.pop_front();
        }
    }

    fn live(&self, now: Instant, window: Duration) -> impl Iterator<Item = &UsageEntry> {
        self.entries
            .iter()
            .skip_while(move |e| !is_live(e, now, window))
    }

    pub fn call_count(&self, now: Instant, window: Duration) -> usize {
        self.live(now, window).count()
    }

    pub fn cost(&self, now: Instant, window: Duration) -> f64 {
        self.live(now, window).map(|e| e.cost_usd).sum()
    }

    pub fn summary(&self, now: Instant, window: Duration) -> WindowSummary {
        let mut summary = WindowSummary::default();
        let mut latency_total = Duration::ZERO;
        let mut settled = 0u32;
        for entry in self.live(now, window) {
            summary.calls += 1;
            summary.cost_usd += entry.cost_usd;
            summary.tokens += entry.tokens;
            if !entry.pending {
                latency_total += entry.latency;
                settled = settled.saturating_add(1);
            }
        }
        if settled > 0 {
            summary.average_latency = latency_total / settled;
        }
        summary
    }

    /// Wait until the live call count drops below `limit`.
    pub fn retry_after_calls(&self, now: Instant, window: Duration, limit: usize) -> Duration {
        if limit == 0 {
            return window;
        }
        let live: Vec<&UsageEntry> = self.live(now, window).collect();
        if live.len() < limit {
            return Duration::ZERO;
        }
        // The entry whose expiry brings the count to limit - 1.
        let pivot = live[live.len() - limit];
        expires_in(pivot, now, window)
    }

    /// Wait until the live cost drops below `limit`.
    pub fn retry_after_cost(&self, now: Instant, window: Duration, limit: f64) -> Duration {
        let mut remaining = self.cost(now, window);
        for entry in self.live(now, window) {
            if remaining < limit {
                break;
            }
            remaining -= entry.cost_usd;
            if remaining < limit {
                return expires_in(entry, now, window);
            }
        }
        Duration::ZERO
    }

    /// Fill in the outcome of a pending entry. `false` when it already
    /// expired or was evicted.
    pub fn settle(&mut self, seq: u64, cost_usd: f64, tokens: u64, latency: Duration) -> bool {
        match self.entries.iter_mut().rev().find(|e| e.seq == seq) {
            Some(entry) => {
                entry.cost_usd = cost_usd;
                entry.tokens = tokens;
                entry.latency = latency;
                entry.pending = false;
                true
            }
            None => false,
        }
    }

    pub fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.live(now, window).next().is_none()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn stored(&self) -> usize {
        self.entries.len()
    }
}

fn is_live(entry: &UsageEntry, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(entry.at) < window
}

fn expires_in(entry: &UsageEntry, now: Instant, window: Duration) -> Duration {
    (entry.at + window).saturating_duration_since(now)
}
