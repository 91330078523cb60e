//! Conversation pipeline: privacy filter, admission control, history,
//! breaker-guarded LLM call and local fallback, in that order.
//!
//! A message refused by the filter or the limiter leaves no trace in the
//! session or the usage window. Admission reserves one call against the user;
//! from then on the exchange runs on its own task, so the user turn, the reply
//! (LLM or fallback) and the settled usage are all stored even when the caller
//! stops waiting.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::fallback;
use super::types::{PipelineCounters, PipelineError, PipelineStats, PipelineStatus, Reply};
use crate::concurrency::{CircuitBreaker, CircuitOutcome, FallbackReason};
use crate::config::{Config, PipelineConfig};
use crate::cost::{RateLimiter, Reservation, UsageRecord};
use crate::observability::{self, Observer, ObserverEvent, ObserverMetric};
use crate::providers::{LlmClient, LlmResponse};
use crate::security::SanitizationGate;
use crate::session::{JsonlSessionPersistence, Message, SessionStore};

/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct ConversationPipeline {
    core: Arc<PipelineCore>,
}

struct PipelineCore {
    gate: SanitizationGate,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    sessions: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
    observer: Arc<dyn Observer>,
    config: PipelineConfig,
    counters: PipelineCounters,
}

/// A message that passed the filter and holds a reserved call.
struct Turn {
    session_id: String,
    text: String,
    reservation: Reservation,
}

impl ConversationPipeline {
    /// Assemble a pipeline from shared components. Breaker transitions are
    /// forwarded to `observer`.
    pub fn new(
        config: PipelineConfig,
        sessions: Arc<SessionStore>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        llm: Arc<dyn LlmClient>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let events = Arc::clone(&observer);
        let breaker_name = breaker.name().to_string();
        breaker.on_state_change(move |from, to| {
            events.record_event(&ObserverEvent::CircuitStateChanged {
                breaker: breaker_name.clone(),
                from,
                to,
            });
        });

        Self {
            core: Arc::new(PipelineCore {
                gate: SanitizationGate::new(),
                limiter,
                breaker,
                sessions,
                llm,
                observer,
                config,
                counters: PipelineCounters::default(),
            }),
        }
    }

    /// Build every component from `config`. Sessions are persisted under
    /// `config.data_dir` when `session.persist` is set.
    pub fn from_config(config: &Config, llm: Arc<dyn LlmClient>) -> anyhow::Result<Self> {
        let observer: Arc<dyn Observer> =
            Arc::from(observability::create_observer(&config.observability));

        let mut sessions =
            SessionStore::new(config.session.clone()).with_observer(Arc::clone(&observer));
        if config.session.persist {
            let persistence = JsonlSessionPersistence::new(config.data_dir.clone())?;
            sessions = sessions.with_persistence(Arc::new(persistence));
        }

        let breaker = CircuitBreaker::with_name(llm.name(), config.circuit.clone());

        Ok(Self::new(
            config.pipeline.clone(),
            Arc::new(sessions),
            Arc::new(RateLimiter::new(config.rate_limit.clone())),
            Arc::new(breaker),
            llm,
            observer,
        ))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.core.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.core.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.core.breaker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.core.config
    }

    /// Send one user message through the configured LLM client.
    pub async fn send(
        &self,
        session_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<Reply, PipelineError> {
        self.send_with(Arc::clone(&self.core.llm), session_id, user_id, text)
            .await
    }

    /// Like [`send`](Self::send) with a caller-supplied client. The shared
    /// breaker still guards the call.
    ///
    /// Dropping the returned future after admission does not cancel the
    /// exchange: the reply is still stored and the usage still settled.
    pub async fn send_with(
        &self,
        llm: Arc<dyn LlmClient>,
        session_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<Reply, PipelineError> {
        let turn = self.core.admit(session_id, user_id, text)?;

        let core = Arc::clone(&self.core);
        let exchange = tokio::spawn(async move { core.exchange(llm.as_ref(), turn).await });
        match exchange.await {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                warn!(session_id, error = %e, "Exchange task cancelled");
                Err(PipelineError::Interrupted(e.to_string()))
            }
        }
    }

    /// Run `send` on its own task and hand back the handle.
    pub fn spawn_send(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> JoinHandle<Result<Reply, PipelineError>> {
        let pipeline = self.clone();
        let session_id = session_id.into();
        let user_id = user_id.into();
        let text = text.into();
        tokio::spawn(async move { pipeline.send(&session_id, &user_id, &text).await })
    }

    pub fn stats(&self) -> PipelineStats {
        self.core.counters.snapshot()
    }

    pub async fn status(&self) -> PipelineStatus {
        let core = &self.core;
        PipelineStatus {
            provider: core.llm.name().to_string(),
            pipeline: self.stats(),
            circuit: core.breaker.status(),
            usage: core.limiter.stats(),
            sessions: core.sessions.stats().await,
        }
    }

    /// Flush buffered observer output. Call before the process exits.
    pub fn flush(&self) {
        self.core.observer.flush();
    }
}

impl PipelineCore {
    /// Filter the message and reserve a call for it. Synchronous, so a
    /// rejection never leaves anything behind.
    fn admit(&self, session_id: &str, user_id: &str, text: &str) -> Result<Turn, PipelineError> {
        PipelineCounters::bump(&self.counters.sent);

        let sanitized = self.gate.check(text);
        if !sanitized.is_safe {
            let entities = sanitized.critical_types();
            let kinds: Vec<String> = entities.iter().map(|e| e.as_str().to_string()).collect();
            warn!(session_id, entities = ?kinds, "Message blocked: personal data detected");
            self.observer
                .record_event(&ObserverEvent::SanitizationBlocked {
                    session_id: session_id.to_string(),
                    entities: kinds,
                });
            PipelineCounters::bump(&self.counters.blocked);
            return Err(PipelineError::SanitizationBlocked { entities });
        }

        let reservation = match self.limiter.reserve(user_id) {
            Ok(reservation) => reservation,
            Err(exceeded) => {
                info!(
                    session_id,
                    user_id,
                    scope = %exceeded.scope,
                    retry_after_secs = exceeded.retry_after.as_secs(),
                    "Message rate limited"
                );
                self.observer.record_event(&ObserverEvent::RateLimited {
                    user_id: user_id.to_string(),
                    scope: exceeded.scope.as_str().to_string(),
                    retry_after: exceeded.retry_after,
                });
                PipelineCounters::bump(&self.counters.rate_limited);
                return Err(PipelineError::RateLimited(exceeded));
            }
        };

        Ok(Turn {
            session_id: session_id.to_string(),
            text: sanitized.sanitized_text,
            reservation,
        })
    }

    async fn exchange(&self, llm: &dyn LlmClient, turn: Turn) -> Reply {
        let Turn {
            session_id,
            text,
            reservation,
        } = turn;

        // History is captured before the new turn so it is not sent twice.
        let history = self
            .sessions
            .recent_messages(&session_id, self.config.history_window)
            .await;
        self.sessions
            .append(&session_id, Message::user(text.clone()))
            .await;

        let outcome = self.call_llm(llm, &session_id, &text, &history).await;

        let (response, fallback_reason) = match outcome {
            CircuitOutcome::Success(response) => {
                PipelineCounters::bump(&self.counters.completed);
                (response, None)
            }
            CircuitOutcome::Fallback { value, reason } => {
                info!(%session_id, %reason, "Serving fallback reply");
                self.observer.record_event(&ObserverEvent::FallbackServed {
                    session_id: session_id.clone(),
                    reason: reason.to_string(),
                });
                PipelineCounters::bump(&self.counters.fallbacks);
                (value, Some(reason))
            }
        };

        self.limiter.settle(
            reservation,
            UsageRecord {
                cost_usd: response.cost_usd,
                tokens: response.total_tokens(),
                latency: response.latency,
            },
        );
        self.sessions
            .append(&session_id, Message::assistant(response.content.clone()))
            .await;

        Reply {
            session_id,
            content: response.content,
            sanitized_input: text,
            is_fallback: fallback_reason.is_some(),
            fallback_reason,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            cost_usd: response.cost_usd,
            latency: response.latency,
        }
    }

    async fn call_llm(
        &self,
        llm: &dyn LlmClient,
        session_id: &str,
        text: &str,
        history: &[Message],
    ) -> CircuitOutcome<LlmResponse> {
        let timeout = self.config.llm_timeout();
        let system_prompt = self.config.system_prompt.as_str();

        self.observer.record_event(&ObserverEvent::LlmRequest {
            provider: llm.name().to_string(),
            session_id: session_id.to_string(),
            history_len: history.len(),
        });
        debug!(session_id, provider = llm.name(), history_len = history.len(), "Calling LLM");

        let started = Instant::now();
        let outcome = self
            .breaker
            .execute(
                move || async move {
                    let call = llm.send(text, system_prompt, history);
                    let response = tokio::time::timeout(timeout, call).await.map_err(|_| {
                        anyhow::anyhow!("LLM call timed out after {}s", timeout.as_secs())
                    })??;
                    response.validate()?;
                    Ok::<_, anyhow::Error>(response)
                },
                move || fallback_response(history, text),
            )
            .await;
        let duration = started.elapsed();

        match &outcome {
            CircuitOutcome::Success(response) => {
                self.observer.record_event(&ObserverEvent::LlmResponse {
                    provider: llm.name().to_string(),
                    duration,
                    success: true,
                    error_message: None,
                    input_tokens: Some(response.prompt_tokens),
                    output_tokens: Some(response.completion_tokens),
                });
                self.observer
                    .record_metric(&ObserverMetric::RequestLatency(duration));
                self.observer
                    .record_metric(&ObserverMetric::TokensUsed(response.total_tokens()));
            }
            CircuitOutcome::Fallback {
                reason: FallbackReason::Failed(message),
                ..
            } => {
                warn!(session_id, provider = llm.name(), error = %message, "LLM call failed");
                self.observer.record_event(&ObserverEvent::LlmResponse {
                    provider: llm.name().to_string(),
                    duration,
                    success: false,
                    error_message: Some(message.clone()),
                    input_tokens: None,
                    output_tokens: None,
                });
            }
            // Short-circuited: nothing was sent.
            CircuitOutcome::Fallback { .. } => {}
        }

        outcome
    }
}

/// A fallback reply dressed as a free, instant response.
fn fallback_response(history: &[Message], text: &str) -> LlmResponse {
    LlmResponse {
        content: fallback::compose(history, text),
        prompt_tokens: 0,
        completion_tokens: 0,
        cost_usd: 0.0,
        latency: std::time::Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::CircuitState;
    use crate::config::{CircuitConfig, RateLimitConfig, SessionConfig};
    use crate::cost::LimitScope;
    use crate::providers::LlmClient;
    use crate::session::Role;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted client: pops one result per call, repeats "ok" when empty.
    #[derive(Default)]
    struct ScriptedLlm {
        script: Mutex<VecDeque<anyhow::Result<LlmResponse>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, usize)>>,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        fn with(script: Vec<anyhow::Result<LlmResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn ok(content: &str, cost_usd: f64) -> anyhow::Result<LlmResponse> {
        Ok(LlmResponse {
            content: content.into(),
            prompt_tokens: 10,
            completion_tokens: 20,
            cost_usd,
            latency: Duration::from_millis(5),
        })
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            text: &str,
            _system_prompt: &str,
            history: &[Message],
        ) -> anyhow::Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push((text.to_string(), history.len()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| ok("ok", 0.0))
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<ObserverEvent>>,
        flushes: AtomicUsize,
    }

    impl Observer for RecordingObserver {
        fn record_event(&self, event: &ObserverEvent) {
            self.events.lock().push(event.clone());
        }

        fn record_metric(&self, _metric: &ObserverMetric) {}

        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Harness {
        pipeline: Arc<ConversationPipeline>,
        llm: Arc<ScriptedLlm>,
        observer: Arc<RecordingObserver>,
    }

    fn harness(llm: ScriptedLlm, rate_limit: RateLimitConfig, circuit: CircuitConfig) -> Harness {
        let llm = Arc::new(llm);
        let observer = Arc::new(RecordingObserver::default());
        let pipeline = ConversationPipeline::new(
            PipelineConfig {
                llm_timeout_secs: 1,
                ..PipelineConfig::default()
            },
            Arc::new(SessionStore::new(SessionConfig::default())),
            Arc::new(RateLimiter::new(rate_limit)),
            Arc::new(CircuitBreaker::with_name("llm", circuit)),
            llm.clone(),
            observer.clone(),
        );
        Harness {
            pipeline: Arc::new(pipeline),
            llm,
            observer,
        }
    }

    fn default_harness(llm: ScriptedLlm) -> Harness {
        harness(llm, RateLimitConfig::unlimited(), CircuitConfig::default())
    }

    #[tokio::test]
    async fn happy_path_stores_both_turns_and_records_usage() {
        let h = default_harness(ScriptedLlm::with(vec![ok("Re-enable sync.", 0.002)]));

        let reply = h
            .pipeline
            .send("s1", "u1", "My watch stopped syncing")
            .await
            .unwrap();

        assert!(!reply.is_fallback);
        assert_eq!(reply.content, "Re-enable sync.");
        assert_eq!(reply.cost_usd, 0.002);

        let history = h.pipeline.sessions().history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "My watch stopped syncing");
        assert_eq!(history[1].content, "Re-enable sync.");

        let usage = h.pipeline.limiter().user_stats("u1");
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.tokens, 30);
        assert_eq!(h.pipeline.stats().completed, 1);
    }

    #[tokio::test]
    async fn sanitized_text_is_what_gets_sent_and_stored() {
        let h = default_harness(ScriptedLlm::default());

        let reply = h
            .pipeline
            .send("s1", "u1", "I walked 10,000 steps yesterday")
            .await
            .unwrap();

        assert_eq!(reply.sanitized_input, "I walked [NUMBER] steps [TIME]");
        assert_eq!(h.llm.seen.lock()[0].0, "I walked [NUMBER] steps [TIME]");
        let history = h.pipeline.sessions().history("s1").await;
        assert_eq!(history[0].content, "I walked [NUMBER] steps [TIME]");
    }

    #[tokio::test]
    async fn blocked_message_touches_nothing() {
        let h = default_harness(ScriptedLlm::default());

        let err = h
            .pipeline
            .send("s1", "u1", "email me at jane.doe@example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::SanitizationBlocked { .. }));
        assert_eq!(h.llm.calls(), 0);
        assert!(h.pipeline.sessions().history("s1").await.is_empty());
        assert_eq!(h.pipeline.limiter().user_stats("u1").calls, 0);
        assert_eq!(h.pipeline.stats().blocked, 1);

        let events = h.observer.events.lock();
        let blocked = events.iter().find_map(|e| match e {
            ObserverEvent::SanitizationBlocked { entities, .. } => Some(entities.clone()),
            _ => None,
        });
        assert_eq!(blocked, Some(vec!["email".to_string()]));
    }

    #[tokio::test]
    async fn rate_limited_message_touches_nothing() {
        let h = harness(
            ScriptedLlm::default(),
            RateLimitConfig {
                max_calls_per_user_per_hour: Some(1),
                ..RateLimitConfig::unlimited()
            },
            CircuitConfig::default(),
        );

        h.pipeline.send("s1", "u1", "first").await.unwrap();
        let err = h.pipeline.send("s1", "u1", "second").await.unwrap_err();

        match &err {
            PipelineError::RateLimited(e) => assert_eq!(e.scope, LimitScope::UserCalls),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.retry_after().is_some());
        assert_eq!(h.llm.calls(), 1);
        assert_eq!(h.pipeline.sessions().history("s1").await.len(), 2);

        // Other users keep their own budget.
        assert!(h.pipeline.send("s2", "u2", "hello").await.is_ok());

        let events = h.observer.events.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::RateLimited { scope, .. } if scope == "user_calls"
        )));
    }

    #[tokio::test]
    async fn history_excludes_current_turn_and_respects_window() {
        let h = default_harness(ScriptedLlm::default());

        for text in ["one", "two", "three"] {
            h.pipeline.send("s1", "u1", text).await.unwrap();
        }

        let seen = h.llm.seen.lock();
        assert_eq!(seen[0], ("one".to_string(), 0));
        assert_eq!(seen[1], ("two".to_string(), 2));
        assert_eq!(seen[2], ("three".to_string(), 4));
    }

    #[tokio::test]
    async fn failure_serves_fallback_and_counts_call() {
        let h = default_harness(ScriptedLlm::with(vec![Err(anyhow::anyhow!("503"))]));

        let reply = h
            .pipeline
            .send("s1", "u1", "my sleep data is missing")
            .await
            .unwrap();

        assert!(reply.is_fallback);
        assert!(matches!(reply.fallback_reason, Some(FallbackReason::Failed(_))));
        assert!(reply.content.contains("sleep tracking"));
        assert_eq!(reply.cost_usd, 0.0);

        let history = h.pipeline.sessions().history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, reply.content);

        let usage = h.pipeline.limiter().user_stats("u1");
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn malformed_response_counts_as_failure() {
        let h = default_harness(ScriptedLlm::with(vec![ok("   ", 0.0)]));

        let reply = h.pipeline.send("s1", "u1", "hello").await.unwrap();
        assert!(reply.is_fallback);
        assert_eq!(h.pipeline.breaker().status().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_llm_times_out_into_fallback() {
        let h = default_harness(ScriptedLlm::slow(Duration::from_secs(5)));

        let reply = h.pipeline.send("s1", "u1", "hello").await.unwrap();

        assert!(reply.is_fallback);
        match reply.fallback_reason {
            Some(FallbackReason::Failed(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected reason: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_llm() {
        let h = harness(
            ScriptedLlm::with(vec![Err(anyhow::anyhow!("down"))]),
            RateLimitConfig::unlimited(),
            CircuitConfig {
                failure_threshold: 1,
                ..CircuitConfig::default()
            },
        );

        h.pipeline.send("s1", "u1", "hello").await.unwrap();
        assert_eq!(h.pipeline.breaker().state(), CircuitState::Open);

        let reply = h.pipeline.send("s1", "u1", "hello again").await.unwrap();
        assert!(reply.is_fallback);
        assert_eq!(reply.fallback_reason, Some(FallbackReason::Open));
        assert_eq!(h.llm.calls(), 1);
        assert_eq!(h.pipeline.limiter().user_stats("u1").calls, 2);

        let events = h.observer.events.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            ObserverEvent::CircuitStateChanged {
                to: CircuitState::Open,
                ..
            }
        )));
        let llm_responses = events
            .iter()
            .filter(|e| matches!(e, ObserverEvent::LlmResponse { .. }))
            .count();
        assert_eq!(llm_responses, 1);
    }

    #[tokio::test]
    async fn spawned_send_completes_and_status_aggregates() {
        let h = default_harness(ScriptedLlm::default());

        let handle = h.pipeline.spawn_send("s1", "u1", "hi there");
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply.content, "ok");

        let status = h.pipeline.status().await;
        assert_eq!(status.provider, "scripted");
        assert_eq!(status.pipeline.sent, 1);
        assert_eq!(status.circuit.state, CircuitState::Closed);
        assert_eq!(status.usage.total_calls, 1);
        assert_eq!(status.sessions.session_count, 1);
        assert_eq!(status.sessions.total_messages, 2);

        h.pipeline.flush();
        assert_eq!(h.observer.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_send_still_stores_reply_and_holds_the_budget() {
        let h = harness(
            ScriptedLlm::slow(Duration::from_millis(500)),
            RateLimitConfig {
                max_calls_per_user_per_hour: Some(1),
                ..RateLimitConfig::unlimited()
            },
            CircuitConfig::default(),
        );

        for i in 0..5 {
            let attempt = tokio::time::timeout(
                Duration::from_millis(100),
                h.pipeline.send("s1", "u1", &format!("attempt {i}")),
            )
            .await;
            match attempt {
                Err(_) => assert_eq!(i, 0, "only the admitted send waits on the LLM"),
                Ok(Err(PipelineError::RateLimited(e))) => {
                    assert_eq!(e.scope, LimitScope::UserCalls);
                }
                Ok(other) => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(h.llm.calls(), 1);
        assert_eq!(h.pipeline.limiter().user_stats("u1").calls, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let history = h.pipeline.sessions().history("s1").await;
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(history[0].content, "attempt 0");

        let usage = h.pipeline.limiter().user_stats("u1");
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.tokens, 30);
        assert_eq!(h.pipeline.stats().completed, 1);
        assert_eq!(h.pipeline.stats().rate_limited, 4);
    }

    #[tokio::test]
    async fn send_with_uses_the_given_client_behind_the_shared_breaker() {
        let h = default_harness(ScriptedLlm::default());
        let other = Arc::new(ScriptedLlm::with(vec![ok("from the other client", 0.0)]));

        let reply = h
            .pipeline
            .send_with(other.clone(), "s1", "u1", "hello")
            .await
            .unwrap();

        assert_eq!(reply.content, "from the other client");
        assert_eq!(other.calls(), 1);
        assert_eq!(h.llm.calls(), 0);
        assert_eq!(h.pipeline.breaker().status().total_calls, 1);
    }
}
