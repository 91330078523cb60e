//! Session types: messages, per-conversation state, and the views handed out
//! by the store.

use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation turn. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// UTF-8 size of the content; what `byte_usage` accounts.
    pub fn byte_len(&self) -> usize {
        self.content.len()
    }
}

/// Utilization band of a session relative to `max_messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityLevel {
    Normal,
    Warning,
    Full,
}

impl CapacityLevel {
    fn for_percent(percent: u8, warn_at: u8) -> Self {
        if percent >= 100 {
            CapacityLevel::Full
        } else if percent >= warn_at {
            CapacityLevel::Warning
        } else {
            CapacityLevel::Normal
        }
    }
}

/// Serializable copy of a session, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// What an append did besides adding the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AppendReport {
    pub evicted: usize,
    /// Set when the session entered a higher capacity band.
    pub crossed: Option<CapacityLevel>,
    pub percent: u8,
}

/// Live state of one conversation. Owned by the store; only mutated under
/// that session's lock.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: String,
    pub messages: VecDeque<Message>,
    pub byte_usage: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub capacity: CapacityLevel,
    /// Set once the session is removed from the store. Writers holding a
    /// stale handle must look the id up again.
    pub closed: bool,
    /// Message lines in the persisted record, evicted ones included.
    pub persisted_lines: usize,
    /// The persisted record does not match and must be rewritten whole.
    pub needs_rewrite: bool,
}

impl Session {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            messages: VecDeque::new(),
            byte_usage: 0,
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            capacity: CapacityLevel::Normal,
            closed: false,
            persisted_lines: 0,
            needs_rewrite: true,
        }
    }

    /// Rebuild from a persisted copy, re-applying the current bounds.
    pub fn from_snapshot(snapshot: SessionSnapshot, config: &SessionConfig) -> Self {
        let mut session = Self {
            persisted_lines: snapshot.messages.len(),
            needs_rewrite: false,
            id: snapshot.id,
            byte_usage: snapshot.messages.iter().map(Message::byte_len).sum(),
            messages: snapshot.messages.into(),
            created_at: snapshot.created_at,
            last_activity_at: snapshot.last_activity_at,
            last_activity: Instant::now(),
            capacity: CapacityLevel::Normal,
            closed: false,
        };
        session.enforce_bounds(config);
        let percent = session.utilization_percent(config.max_messages);
        session.capacity = CapacityLevel::for_percent(percent, config.warn_at_percent);
        session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            messages: self.messages.iter().cloned().collect(),
        }
    }

    /// Append then trim. The single mutation path for a session.
    pub fn push(&mut self, message: Message, config: &SessionConfig) -> AppendReport {
        self.byte_usage += message.byte_len();
        self.messages.push_back(message);
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();

        let evicted = self.enforce_bounds(config);

        let percent = self.utilization_percent(config.max_messages);
        let level = CapacityLevel::for_percent(percent, config.warn_at_percent);
        let crossed = (level > self.capacity).then_some(level);
        self.capacity = level;

        AppendReport {
            evicted,
            crossed,
            percent,
        }
    }

    /// FIFO eviction down to `max_messages`, then down to `max_bytes` while
    /// keeping at least the newest message. `byte_usage` is recomputed from
    /// what remains.
    fn enforce_bounds(&mut self, config: &SessionConfig) -> usize {
        let mut evicted = 0;
        while self.messages.len() > config.max_messages.max(1) {
            self.messages.pop_front();
            evicted += 1;
        }
        while self.messages.len() > 1 && self.current_bytes() > config.max_bytes {
            self.messages.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.byte_usage = self.current_bytes();
        }
        evicted
    }

    fn current_bytes(&self) -> usize {
        self.messages.iter().map(Message::byte_len).sum()
    }

    pub fn utilization_percent(&self, max_messages: usize) -> u8 {
        let max = max_messages.max(1);
        let percent = (self.messages.len() * 100 / max).min(100);
        u8::try_from(percent).unwrap_or(100)
    }

    pub fn recent(&self, n: usize) -> Vec<Message> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Empty the session and mark it dead.
    pub fn close(&mut self) {
        self.messages.clear();
        self.byte_usage = 0;
        self.closed = true;
    }
}

/// Aggregate view across all live sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub session_count: usize,
    pub total_messages: usize,
    pub total_bytes: usize,
    pub max_messages_per_session: usize,
    pub max_bytes_per_session: usize,
}

/// Utilization of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionUsage {
    pub message_count: usize,
    pub byte_usage: usize,
    /// Share of `max_messages` in use, 0..=100
    pub utilization_percent: u8,
    pub capacity: CapacityLevel,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}
