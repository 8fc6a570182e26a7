use serde::{Deserialize, Serialize};

use super::message::{Message, Role};
use super::tool::{ToolChoice, ToolDefinition};
use crate::error::LlmError;

/// Sampling parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Canonical completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub params: CompletionParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: bool,
    /// Backend pinned by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Explicit conversation identifier, overrides key derivation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CompletionRequest {
    /// Reject requests that no backend could answer
    ///
    /// Runs before candidate selection so a malformed request never costs
    /// an upstream call.
    pub fn validate(&self) -> Result<(), LlmError> {
        if self.model.trim().is_empty() {
            return Err(LlmError::InvalidRequest("`model` must not be empty".to_owned()));
        }

        if self.messages.is_empty() {
            return Err(LlmError::InvalidRequest("`messages` must not be empty".to_owned()));
        }

        if let Some(temperature) = self.params.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(LlmError::InvalidRequest(format!(
                "`temperature` must be between 0 and 2, got {temperature}"
            )));
        }

        for (i, tool) in self.tools.iter().flatten().enumerate() {
            if tool.function.name.trim().is_empty() {
                return Err(LlmError::InvalidRequest(format!("tools[{i}].function.name must not be empty")));
            }
        }

        for (i, message) in self.messages.iter().enumerate() {
            if message.role == Role::Tool && message.tool_call_id.as_deref().is_none_or(str::is_empty) {
                return Err(LlmError::InvalidRequest(format!("messages[{i}]: tool messages require `tool_call_id`")));
            }
        }

        Ok(())
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Whether the history already contains a model reply
    pub fn has_assistant_turn(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::Assistant)
    }
}
