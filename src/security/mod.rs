//! Privacy enforcement for outbound text.
//!
//! The [`SanitizationGate`] sits in front of every LLM call. Non-critical
//! entities are replaced with placeholders; critical ones block the message.

pub mod sanitize;

pub use sanitize::{DetectedEntity, EntityType, SanitizationGate, SanitizationResult, Span};
