pub mod limiter;
pub mod types;
mod window;

pub use limiter::{RateLimiter, Reservation};
pub use types::{LimitScope, RateLimitExceeded, UsageRecord, UsageStats, UserUsageStats};
