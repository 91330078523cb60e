pub mod schema;

pub use schema::{
    CircuitConfig, Config, ModelPricing, ObservabilityConfig, PipelineConfig, ProviderConfig,
    RateLimitConfig, SessionConfig,
};
