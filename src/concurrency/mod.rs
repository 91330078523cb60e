//! Failure isolation for calls to external dependencies.
//!
//! One [`CircuitBreaker`] per downstream dependency, shared by every session.

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitOutcome, CircuitState, CircuitStatus, FallbackReason,
};
