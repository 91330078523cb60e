//! In-memory session store with one async lock per session.
//!
//! The id → session map sits behind a short-lived `parking_lot::RwLock` that
//! is never held across an await. Each session has its own
//! `tokio::sync::Mutex`, so appends to the same id are totally ordered while
//! different ids never contend. Removal (clear, reaping) marks the session
//! closed under its own lock before unlinking it; a writer that raced the
//! removal sees the flag and retries against a fresh session.

use super::persistence::SessionPersistence;
use super::types::{Message, Session, SessionSnapshot, SessionStats, SessionUsage};
use crate::config::SessionConfig;
use crate::observability::{NoopObserver, Observer, ObserverEvent, ObserverMetric};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SessionHandle = Arc<Mutex<Session>>;

/// Persisted records may hold this many times `max_messages` lines before
/// the next write compacts them.
const REWRITE_FACTOR: usize = 2;

/// How the next persisted write brings the record up to date.
enum PersistWrite {
    Rewrite(SessionSnapshot),
    Append(Message),
}

pub struct SessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    observer: Arc<dyn Observer>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            persistence: None,
            observer: Arc::new(NoopObserver),
        }
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Live sessions currently held in memory.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Append a message, creating the session on first reference, then trim
    /// to the configured bounds.
    pub async fn append(&self, session_id: &str, message: Message) {
        loop {
            let handle = self.get_or_create(session_id);
            let mut session = handle.lock_owned().await;
            if session.closed {
                continue;
            }

            let report = session.push(message, &self.config);
            let message_count = session.messages.len();
            let byte_usage = session.byte_usage;
            self.persist(session).await;

            if report.evicted > 0 {
                debug!(
                    session_id,
                    evicted = report.evicted,
                    byte_usage,
                    "Trimmed session history"
                );
                self.observer.record_event(&ObserverEvent::SessionTrimmed {
                    session_id: session_id.to_string(),
                    evicted: report.evicted,
                    byte_usage,
                });
            }
            if let Some(level) = report.crossed {
                warn!(
                    session_id,
                    percent = report.percent,
                    message_count,
                    ?level,
                    "Session capacity threshold crossed"
                );
                self.observer.record_event(&ObserverEvent::SessionCapacity {
                    session_id: session_id.to_string(),
                    percent: report.percent,
                    message_count,
                });
            }
            return;
        }
    }

    /// Full ordered history; empty for unknown ids.
    pub async fn history(&self, session_id: &str) -> Vec<Message> {
        let Some(handle) = self.existing(session_id) else {
            return Vec::new();
        };
        let session = handle.lock().await;
        session.messages.iter().cloned().collect()
    }

    /// The last `n` messages in order.
    pub async fn recent_messages(&self, session_id: &str, n: usize) -> Vec<Message> {
        let Some(handle) = self.existing(session_id) else {
            return Vec::new();
        };
        let session = handle.lock().await;
        session.recent(n)
    }

    pub async fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            max_messages_per_session: self.config.max_messages,
            max_bytes_per_session: self.config.max_bytes,
            ..SessionStats::default()
        };
        for (_, handle) in self.snapshot_handles() {
            let session = handle.lock().await;
            if session.closed {
                continue;
            }
            stats.session_count += 1;
            stats.total_messages += session.messages.len();
            stats.total_bytes += session.byte_usage;
        }
        stats
    }

    /// Per-session utilization, keyed by session id.
    pub async fn session_usage(&self) -> HashMap<String, SessionUsage> {
        let mut usage = HashMap::new();
        for (id, handle) in self.snapshot_handles() {
            let session = handle.lock().await;
            if session.closed {
                continue;
            }
            usage.insert(
                id,
                SessionUsage {
                    message_count: session.messages.len(),
                    byte_usage: session.byte_usage,
                    utilization_percent: session.utilization_percent(self.config.max_messages),
                    capacity: session.capacity,
                    created_at: session.created_at,
                    last_activity_at: session.last_activity_at,
                },
            );
        }
        usage
    }

    /// Destroy one session, including its persisted copy. Returns whether it
    /// existed in memory.
    pub async fn clear(&self, session_id: &str) -> bool {
        let handle = self.sessions.read().get(session_id).cloned();
        let existed = match handle {
            Some(handle) => {
                let mut session = handle.lock().await;
                let was_live = !session.closed;
                session.close();
                self.unlink(session_id, &handle);
                self.forget_persisted(session_id);
                was_live
            }
            None => {
                self.forget_persisted(session_id);
                false
            }
        };
        self.report_active();
        existed
    }

    pub async fn clear_all(&self) {
        let handles = self.snapshot_handles();
        for (id, handle) in &handles {
            let mut session = handle.lock().await;
            session.close();
            self.unlink(id, handle);
            self.forget_persisted(id);
        }
        info!(count = handles.len(), "Cleared all sessions");
        self.report_active();
    }

    /// Remove sessions idle for at least `idle_timeout`. Sessions whose lock
    /// is held are in use and skipped.
    pub fn reap_idle(&self) -> usize {
        let timeout = self.config.idle_timeout();
        let mut reaped = 0;
        for (id, handle) in self.snapshot_handles() {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if session.closed || session.idle_for() < timeout {
                continue;
            }
            session.close();
            self.unlink(&id, &handle);
            self.forget_persisted(&id);
            reaped += 1;
        }

        if reaped > 0 {
            info!(count = reaped, "Reaped idle sessions");
            self.observer
                .record_event(&ObserverEvent::SessionsReaped { count: reaped });
        }
        self.report_active();
        reaped
    }

    /// Run [`SessionStore::reap_idle`] every `period` until the store is
    /// dropped.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.reap_idle();
            }
        })
    }

    fn get_or_create(&self, session_id: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.read().get(session_id) {
            return Arc::clone(handle);
        }

        let restored = self.load_persisted(session_id);
        let mut sessions = self.sessions.write();
        let handle = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let session = restored.unwrap_or_else(|| Session::new(session_id));
                Arc::new(Mutex::new(session))
            })
            .clone();
        let count = sessions.len();
        drop(sessions);
        self.observer
            .record_metric(&ObserverMetric::ActiveSessions(count as u64));
        handle
    }

    /// Live handle for reads; restores from persistence but never creates.
    fn existing(&self, session_id: &str) -> Option<SessionHandle> {
        if let Some(handle) = self.sessions.read().get(session_id) {
            return Some(Arc::clone(handle));
        }
        let restored = self.load_persisted(session_id)?;
        let mut sessions = self.sessions.write();
        Some(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(restored)))
                .clone(),
        )
    }

    fn snapshot_handles(&self) -> Vec<(String, SessionHandle)> {
        self.sessions
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    /// Drop the map entry only if it still points at `handle`.
    fn unlink(&self, session_id: &str, handle: &SessionHandle) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            sessions.remove(session_id);
        }
    }

    fn load_persisted(&self, session_id: &str) -> Option<Session> {
        let persistence = self.persistence.as_ref()?;
        match persistence.load(session_id) {
            Ok(Some(snapshot)) => {
                debug!(session_id, messages = snapshot.messages.len(), "Restored session");
                Some(Session::from_snapshot(snapshot, &self.config))
            }
            Ok(None) => None,
            Err(e) => {
                self.persistence_error(&e);
                None
            }
        }
    }

    /// Write the newest message, or the whole session when the record is
    /// stale or has grown well past the bounds. File I/O runs on the blocking
    /// pool and the session stays locked until it lands, even if the caller
    /// goes away.
    async fn persist(&self, mut session: OwnedMutexGuard<Session>) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        let write = self.plan_write(&mut session);

        let written = tokio::task::spawn_blocking(move || {
            let result = match &write {
                PersistWrite::Rewrite(snapshot) => persistence.save(snapshot),
                PersistWrite::Append(message) => {
                    persistence.append(&session.id, session.created_at, message)
                }
            };
            if result.is_err() {
                session.needs_rewrite = true;
            }
            result
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.persistence_error(&e),
            Err(e) => self.persistence_error(&anyhow::Error::new(e)),
        }
    }

    fn plan_write(&self, session: &mut Session) -> PersistWrite {
        let compact_at = self.config.max_messages.max(1) * REWRITE_FACTOR;
        let newest = session.messages.back().cloned();
        match newest {
            Some(message) if !session.needs_rewrite && session.persisted_lines < compact_at => {
                session.persisted_lines += 1;
                PersistWrite::Append(message)
            }
            _ => {
                session.needs_rewrite = false;
                session.persisted_lines = session.messages.len();
                PersistWrite::Rewrite(session.snapshot())
            }
        }
    }

    fn forget_persisted(&self, session_id: &str) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.remove(session_id) {
                self.persistence_error(&e);
            }
        }
    }

    fn persistence_error(&self, error: &anyhow::Error) {
        warn!(error = %error, "Session persistence failed");
        self.observer.record_event(&ObserverEvent::Error {
            component: "persistence".into(),
            message: error.to_string(),
        });
    }

    fn report_active(&self) {
        let count = self.session_count() as u64;
        self.observer
            .record_metric(&ObserverMetric::ActiveSessions(count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::persistence::JsonlSessionPersistence;
    use crate::session::types::{CapacityLevel, Role};
    use tempfile::TempDir;

    fn store(max_messages: usize) -> SessionStore {
        SessionStore::new(SessionConfig {
            max_messages,
            ..SessionConfig::default()
        })
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: parking_lot::Mutex<Vec<ObserverEvent>>,
    }

    impl Observer for RecordingObserver {
        fn record_event(&self, event: &ObserverEvent) {
            self.events.lock().push(event.clone());
        }

        fn record_metric(&self, _metric: &ObserverMetric) {}

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn append_creates_and_history_preserves_order() {
        let store = store(10);
        store.append("s1", Message::user("hello")).await;
        store.append("s1", Message::assistant("hi there")).await;

        let history = store.history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "hi there");
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn reads_do_not_create_sessions() {
        let store = store(10);
        assert!(store.history("ghost").await.is_empty());
        assert!(store.recent_messages("ghost", 3).await.is_empty());
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn trimming_keeps_invariants() {
        let store = store(4);
        for i in 0..10 {
            store.append("s", Message::user(format!("message number {i}"))).await;
        }
        let stats = store.stats().await;
        assert_eq!(stats.total_messages, 4);
        let history = store.history("s").await;
        assert_eq!(
            stats.total_bytes,
            history.iter().map(|m| m.content.len()).sum::<usize>()
        );
        assert_eq!(history[0].content, "message number 6");
    }

    #[tokio::test]
    async fn recent_messages_returns_tail() {
        let store = store(10);
        for i in 0..5 {
            store.append("s", Message::user(format!("{i}"))).await;
        }
        let recent: Vec<_> = store
            .recent_messages("s", 2)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(recent, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_session_lose_nothing() {
        let store = Arc::new(store(1000));
        let mut tasks = Vec::new();
        for t in 0..32 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.append("shared", Message::user(format!("from task {t}"))).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history = store.history("shared").await;
        assert_eq!(history.len(), 32);
        let mut seen: Vec<_> = history.iter().map(|m| m.content.clone()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 32);

        let usage = store.session_usage().await;
        assert_eq!(
            usage["shared"].byte_usage,
            history.iter().map(|m| m.content.len()).sum::<usize>()
        );
    }

    #[tokio::test]
    async fn held_session_lock_does_not_block_other_sessions() {
        let store = Arc::new(store(10));
        store.append("busy", Message::user("x")).await;

        let handle = store.get_or_create("busy");
        let _guard = handle.lock().await;

        tokio::time::timeout(
            Duration::from_secs(1),
            store.append("other", Message::user("y")),
        )
        .await
        .expect("other session must not wait on busy session");
        assert_eq!(store.history("other").await.len(), 1);
    }

    #[tokio::test]
    async fn clear_removes_session_and_next_append_starts_fresh() {
        let store = store(10);
        store.append("s", Message::user("a")).await;
        assert!(store.clear("s").await);
        assert!(!store.clear("s").await);
        assert!(store.history("s").await.is_empty());

        store.append("s", Message::user("b")).await;
        assert_eq!(store.history("s").await.len(), 1);
    }

    #[tokio::test]
    async fn append_racing_clear_lands_in_a_live_session() {
        let store = Arc::new(store(10));
        store.append("s", Message::user("before")).await;

        let handle = store.get_or_create("s");
        let guard = handle.lock().await;
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.append("s", Message::user("after")).await })
        };
        tokio::task::yield_now().await;

        // Simulate clear finishing while the writer waits on the old handle.
        drop(guard);
        store.clear("s").await;
        writer.await.unwrap();

        let history = store.history("s").await;
        assert!(history.len() <= 1);
        assert!(history.iter().all(|m| m.content == "after"));
    }

    #[tokio::test]
    async fn clear_all_empties_store() {
        let store = store(10);
        for id in ["a", "b", "c"] {
            store.append(id, Message::user("x")).await;
        }
        store.clear_all().await;
        assert_eq!(store.session_count(), 0);
        assert_eq!(store.stats().await.session_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_only_idle_sessions() {
        let store = SessionStore::new(SessionConfig {
            idle_timeout_secs: 60,
            ..SessionConfig::default()
        });
        store.append("old", Message::user("x")).await;
        tokio::time::advance(Duration::from_secs(45)).await;
        store.append("fresh", Message::user("y")).await;
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(store.reap_idle(), 1);
        assert!(store.history("old").await.is_empty());
        assert_eq!(store.history("fresh").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_runs_periodically() {
        let store = Arc::new(SessionStore::new(SessionConfig {
            idle_timeout_secs: 30,
            ..SessionConfig::default()
        }));
        store.append("s", Message::user("x")).await;
        let reaper = store.spawn_reaper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(store.session_count(), 0);
        reaper.abort();
    }

    #[tokio::test]
    async fn capacity_events_are_emitted_once_per_threshold() {
        let observer = Arc::new(RecordingObserver::default());
        let store = SessionStore::new(SessionConfig {
            max_messages: 5,
            warn_at_percent: 80,
            ..SessionConfig::default()
        })
        .with_observer(observer.clone());

        for i in 0..7 {
            store.append("s", Message::user(format!("{i}"))).await;
        }

        let events = observer.events.lock();
        let capacity: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ObserverEvent::SessionCapacity { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(capacity, vec![80, 100]);
        let trimmed = events
            .iter()
            .filter(|e| matches!(e, ObserverEvent::SessionTrimmed { .. }))
            .count();
        assert_eq!(trimmed, 2);
        drop(events);

        let usage = store.session_usage().await;
        assert_eq!(usage["s"].capacity, CapacityLevel::Full);
        assert_eq!(usage["s"].utilization_percent, 100);
    }

    #[tokio::test]
    async fn persisted_sessions_survive_a_new_store() {
        let tmp = TempDir::new().unwrap();
        let persistence: Arc<dyn SessionPersistence> =
            Arc::new(JsonlSessionPersistence::new(tmp.path()).unwrap());

        let first = store(10).with_persistence(Arc::clone(&persistence));
        first.append("s", Message::user("remember me")).await;
        first.append("s", Message::assistant("noted")).await;
        drop(first);

        let second = store(10).with_persistence(Arc::clone(&persistence));
        let history = second.history("s").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "remember me");

        second.clear("s").await;
        let third = store(10).with_persistence(persistence);
        assert!(third.history("s").await.is_empty());
    }

    #[tokio::test]
    async fn corrupted_persisted_session_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let persistence = Arc::new(JsonlSessionPersistence::new(tmp.path()).unwrap());
        std::fs::write(persistence.path_for("s"), "garbage").unwrap();

        let store = store(10).with_persistence(persistence);
        store.append("s", Message::user("fresh start")).await;
        let history = store.history("s").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "fresh start");
    }

    #[tokio::test]
    async fn persisted_record_grows_by_appends_then_compacts() {
        let tmp = TempDir::new().unwrap();
        let persistence = Arc::new(JsonlSessionPersistence::new(tmp.path()).unwrap());
        let path = persistence.path_for("s");
        let lines = || std::fs::read_to_string(&path).unwrap().lines().count();

        let store = store(2).with_persistence(persistence.clone());
        store.append("s", Message::user("m1")).await;
        assert_eq!(lines(), 2);
        for (i, expected) in [(2, 3), (3, 4), (4, 5)] {
            store.append("s", Message::user(format!("m{i}"))).await;
            assert_eq!(lines(), expected, "message {i} is a single appended line");
        }

        // Evicted lines still in the file are trimmed away on load.
        let reopened = SessionStore::new(SessionConfig {
            max_messages: 2,
            ..SessionConfig::default()
        })
        .with_persistence(persistence.clone());
        let contents: Vec<String> = reopened
            .history("s")
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        store.append("s", Message::user("m5")).await;
        assert_eq!(lines(), 3, "rewritten as header plus the kept messages");
    }
}
