pub mod compatible;
pub mod traits;

pub use compatible::OpenAiCompatibleClient;
pub use traits::{LlmClient, LlmResponse};

use crate::config::ProviderConfig;
use std::sync::Arc;

/// Factory: build the configured LLM client.
pub fn create_client(config: &ProviderConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let client = OpenAiCompatibleClient::from_config(config)?;
    if client.api_key.is_none() {
        tracing::warn!(
            provider = %config.kind,
            "No API key configured; requests will likely be rejected"
        );
    }
    Ok(Arc::new(client))
}
