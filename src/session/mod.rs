//! Conversation history.
//!
//! [`SessionStore`] owns every [`Message`] list, bounds it by count and bytes,
//! and serializes writers per session id. [`SessionPersistence`] is an optional
//! durable backing.

pub mod persistence;
pub mod store;
pub mod types;

pub use persistence::{JsonlSessionPersistence, SessionPersistence, StorageError};
pub use store::SessionStore;
pub use types::{CapacityLevel, Message, Role, SessionSnapshot, SessionStats, SessionUsage};
