//! Wire format of the stateful conversation backend
//!
//! The backend keeps history server-side. A conversation is created once,
//! then each turn posts only the newest prompt together with the id of the
//! message it continues from.

use serde::{Deserialize, Serialize};

/// `POST {base}/conversations`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub id: String,
}

/// `POST {base}/conversations/{id}/messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub model: String,
    pub prompt: String,
    /// Message this turn continues from; `null` on the first turn
    pub parent_message_id: Option<String>,
    /// First turn of a conversation only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub conversation_id: String,
    /// Continuation token for the next turn
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<ThreadedUsage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreadedUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// `data:` payloads of a streamed turn, terminated by `[DONE]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadedStreamEvent {
    Start {
        message_id: String,
    },
    Delta {
        content: String,
    },
    Finish {
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        usage: Option<ThreadedUsage>,
    },
    Error {
        message: String,
    },
}
