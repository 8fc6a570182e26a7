use serde::{Deserialize, Serialize};

use super::message::FunctionCall;
use super::response::{FinishReason, Usage};

/// Event in a canonical completion stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Delta(StreamDelta),
    /// Final usage, sent near the end of the stream
    Usage(Usage),
    /// New continuation state from a stateful backend
    ///
    /// Consumed by the router and never forwarded to callers.
    Continuation(Continuation),
    Done,
}

/// Continuation state extracted from a stateful backend's response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    /// Backend-native conversation identifier
    pub conversation_id: String,
    /// Reference to attach to the next outgoing turn
    pub token: String,
}

/// Incremental update within a streaming response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<StreamToolCall>,
    /// Present on the final delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl StreamDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Partial tool call data within a stream delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToolCall {
    /// Position in the `tool_calls` array
    pub index: u32,
    /// Present on the first chunk only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<StreamFunctionCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arguments JSON fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl StreamFunctionCall {
    pub fn into_function_call(self) -> Option<FunctionCall> {
        match (self.name, self.arguments) {
            (Some(name), Some(arguments)) => Some(FunctionCall { name, arguments }),
            _ => None,
        }
    }
}
