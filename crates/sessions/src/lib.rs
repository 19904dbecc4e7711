//! Session and conversation lifecycle.
//!
//! Idempotent session→sandbox binding with distributed single-flight,
//! the idle-session janitor, and the bounded per-session conversation
//! store.

pub mod conversation;
pub mod janitor;
pub mod manager;

pub use conversation::ConversationStore;
pub use janitor::JanitorService;
pub use manager::{AcquireOptions, SessionManager, SessionRecord};
