//! Anthropic Messages API wire format

use serde::{Deserialize, Serialize};

// -- Request --

/// Anthropic Messages API request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicRequest {
    /// Model identifier
    pub model: String,
    /// Maximum tokens to generate, required by the API
    pub max_tokens: u32,
    /// System prompt, lifted out of the message list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversation messages, alternating user and assistant
    pub messages: Vec<AnthropicMessage>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Whether to stream the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Tool definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    /// Tool choice configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,
}

/// Anthropic message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    /// `user` or `assistant`
    pub role: String,
    /// Message content
    pub content: AnthropicContent,
}

/// Anthropic content can be a string or array of blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    /// Plain text
    Text(String),
    /// Array of content blocks
    Blocks(Vec<AnthropicContentBlock>),
}

/// Anthropic content block in a request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    /// Text block
    Text {
        /// The text string
        text: String,
    },
    /// Image block
    Image {
        /// Image source
        source: AnthropicImageSource,
    },
    /// Tool use block from an earlier assistant turn
    ToolUse {
        /// Tool use identifier
        id: String,
        /// Tool name
        name: String,
        /// Tool input
        input: serde_json::Value,
    },
    /// Result of a tool use
    ToolResult {
        /// Tool use ID this result is for
        tool_use_id: String,
        /// Result content
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
}

/// Anthropic image source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicImageSource {
    /// Inline base64 image
    Base64 {
        /// MIME type (e.g. "image/png")
        media_type: String,
        /// Base64-encoded data
        data: String,
    },
    /// Image fetched by the API
    Url {
        /// Image URL
        url: String,
    },
}

/// Anthropic tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for tool input
    pub input_schema: serde_json::Value,
}

/// Anthropic tool choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicToolChoice {
    /// `auto`, `any` or `tool`
    #[serde(rename = "type")]
    pub choice_type: String,
    /// Tool to force, with `tool` only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// -- Response --

/// Anthropic Messages API response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicResponse {
    /// Message identifier
    pub id: String,
    /// Content blocks
    pub content: Vec<AnthropicResponseBlock>,
    /// Model used
    pub model: String,
    /// Why generation stopped
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Token usage
    pub usage: AnthropicUsage,
}

/// Anthropic content block in a response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicResponseBlock {
    /// Text block
    Text {
        /// Generated text
        text: String,
    },
    /// Tool use request
    ToolUse {
        /// Tool use identifier
        id: String,
        /// Tool name
        name: String,
        /// Tool input
        input: serde_json::Value,
    },
    /// Thinking and other block kinds the gateway does not relay
    #[serde(other)]
    Other,
}

/// Anthropic token usage
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    /// Input tokens
    #[serde(default)]
    pub input_tokens: u32,
    /// Output tokens
    #[serde(default)]
    pub output_tokens: u32,
}

// -- Streaming --

/// Anthropic SSE event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    /// Message started
    MessageStart {
        /// Initial message metadata
        message: AnthropicStreamMessage,
    },
    /// Content block started
    ContentBlockStart {
        /// Block index
        index: u32,
        /// Initial block content
        content_block: AnthropicStreamContentBlock,
    },
    /// Content block delta
    ContentBlockDelta {
        /// Block index
        index: u32,
        /// Delta content
        delta: AnthropicStreamDelta,
    },
    /// Content block finished
    ContentBlockStop {
        /// Block index
        index: u32,
    },
    /// Message-level delta carrying the stop reason
    MessageDelta {
        /// Delta content
        delta: AnthropicMessageDelta,
        /// Cumulative output usage
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    /// Message finished
    MessageStop,
    /// Keep-alive
    Ping,
    /// In-band failure after the stream started
    Error {
        /// Error details
        error: AnthropicErrorDetail,
    },
}

/// Message metadata in `message_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicStreamMessage {
    /// Message identifier
    pub id: String,
    /// Model used
    pub model: String,
    /// Input usage known at start
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// Block announced by `content_block_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamContentBlock {
    /// Text block, usually empty at start
    Text {
        /// Initial text
        #[serde(default)]
        text: String,
    },
    /// Tool use block, input arrives as JSON deltas
    ToolUse {
        /// Tool use identifier
        id: String,
        /// Tool name
        name: String,
    },
    #[serde(other)]
    Other,
}

/// Anthropic content delta
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamDelta {
    /// Text fragment
    TextDelta {
        /// Text content
        text: String,
    },
    /// Tool input fragment
    InputJsonDelta {
        /// Partial JSON string
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

/// Message-level delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessageDelta {
    /// Stop reason
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Anthropic error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicErrorDetail {
    /// Error category
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable message
    pub message: String,
}
