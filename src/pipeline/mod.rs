pub mod executor;
pub mod fallback;
pub mod types;

pub use executor::ConversationPipeline;
pub use types::{PipelineError, PipelineStats, PipelineStatus, Reply};
