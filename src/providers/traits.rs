use crate::session::Message;
use async_trait::async_trait;
use std::time::Duration;

/// One completed LLM exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub latency: Duration,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Reject responses the pipeline cannot use. A malformed reply is a
    /// failed call, same as a transport error.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.content.trim().is_empty() {
            anyhow::bail!("LLM returned empty content");
        }
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            anyhow::bail!("LLM response carried invalid cost {}", self.cost_usd);
        }
        Ok(())
    }
}

/// Narrow capability the pipeline needs from a remote model. Treated as
/// opaque and untrusted.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logs and events.
    fn name(&self) -> &str;

    async fn send(
        &self,
        text: &str,
        system_prompt: &str,
        history: &[Message],
    ) -> anyhow::Result<LlmResponse>;

    /// Warm up the HTTP connection pool (TLS handshake, DNS).
    /// Default implementation is a no-op.
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
