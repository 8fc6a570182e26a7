use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Continuation state for one conversation on one stateful backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub backend: String,
    pub conversation_key: String,
    /// Backend-native conversation identifier
    pub conversation_id: String,
    /// Reference attached to the next outgoing turn
    pub continuation_token: Option<String>,
    pub turn_count: u32,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub expires_at: Timestamp,
}

impl SessionRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at < now
    }
}

/// Audit record for one inbound call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub id: Uuid,
    pub request_id: String,
    pub started_at: Timestamp,
    pub duration_ms: u64,
    /// Backend that produced the response, if any did
    pub backend: Option<String>,
    pub conversation_key: Option<String>,
    pub stream: bool,
    pub public_request: serde_json::Value,
    pub native_request: Option<serde_json::Value>,
    pub native_response: Option<serde_json::Value>,
    pub public_response: Option<serde_json::Value>,
    pub usage: Option<ExchangeUsage>,
    /// Failed attempts in the order they were made
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend: String,
    pub error: String,
}
