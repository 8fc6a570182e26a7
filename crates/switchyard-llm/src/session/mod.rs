//! Session Manager: continuation chains for stateful backends
//!
//! Stateless backends never touch this module. For a stateful backend each
//! conversation is a chain of turns; the manager maps a conversation key to
//! the backend's latest continuation token and keeps turns of one
//! conversation from running concurrently.

mod clock;
pub mod key;
mod manager;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{SessionManager, TurnGuard};

/// What a stateful backend needs to continue a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub conversation_key: String,
    /// Backend-native conversation, `None` until the first turn commits
    pub conversation_id: Option<String>,
    pub continuation_token: Option<String>,
}

impl SessionContext {
    /// Context for a brand new chain
    pub fn fresh(conversation_key: impl Into<String>) -> Self {
        Self {
            conversation_key: conversation_key.into(),
            conversation_id: None,
            continuation_token: None,
        }
    }

    pub const fn is_first_turn(&self) -> bool {
        self.continuation_token.is_none()
    }
}
