//! Conversation memory
//!
//! In-process, per-conversation turn history with:
//! - a fixed sliding window of turns per conversation
//! - lazy idle expiry (TTL) evaluated on access
//! - least-recently-active eviction past a global conversation limit

mod store;
pub mod types;

pub use store::{ConversationStore, MemoryPolicy};
pub use types::{Role, StoreStats, Turn};
