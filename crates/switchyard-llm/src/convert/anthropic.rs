//! Conversion between canonical types and the Anthropic Messages API

use crate::error::LlmError;
use crate::protocol::anthropic::{
    AnthropicContent, AnthropicContentBlock, AnthropicImageSource, AnthropicMessage, AnthropicRequest,
    AnthropicResponse, AnthropicResponseBlock, AnthropicStreamContentBlock, AnthropicStreamDelta, AnthropicStreamEvent,
    AnthropicTool, AnthropicToolChoice,
};
use crate::types::response::build_tool_call;
use crate::types::{
    ChoiceMessage, CompletionRequest, CompletionResponse, Content, ContentPart, FinishReason, Message, Role,
    StreamDelta, StreamEvent, StreamFunctionCall, StreamToolCall, ToolChoice, ToolChoiceMode, Usage,
};

/// Anthropic requires `max_tokens` on every request
const DEFAULT_MAX_TOKENS: u32 = 4096;

// -- Request --

/// Build the native request for an `anthropic` backend
///
/// System messages are lifted into the top-level `system` field, joined
/// with blank lines when there is more than one.
pub fn to_native(req: &CompletionRequest) -> AnthropicRequest {
    let system: Vec<String> = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_text())
        .collect();

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            })
            .collect()
    });

    AnthropicRequest {
        model: req.model.clone(),
        max_tokens: req.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages: merge_consecutive(
            req.messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(message_to_native)
                .collect(),
        ),
        temperature: req.params.temperature,
        top_p: req.params.top_p,
        stop_sequences: req.params.stop.clone(),
        stream: req.stream.then_some(true),
        tools,
        tool_choice: req.tool_choice.as_ref().and_then(tool_choice_to_native),
    }
}

fn message_to_native(msg: &Message) -> AnthropicMessage {
    if msg.role == Role::Tool {
        return AnthropicMessage {
            role: "user".to_owned(),
            content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: Some(msg.content.as_text()),
            }]),
        };
    }

    let role = if msg.role == Role::Assistant { "assistant" } else { "user" };

    if let Some(tool_calls) = &msg.tool_calls {
        let mut blocks = Vec::new();
        let text = msg.content.as_text();
        if !text.is_empty() {
            blocks.push(AnthropicContentBlock::Text { text });
        }
        for call in tool_calls {
            let input =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
            blocks.push(AnthropicContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
        return AnthropicMessage {
            role: role.to_owned(),
            content: AnthropicContent::Blocks(blocks),
        };
    }

    let content = match &msg.content {
        Content::Text(text) => AnthropicContent::Text(text.clone()),
        Content::Parts(parts) => AnthropicContent::Blocks(parts.iter().map(part_to_native).collect()),
    };

    AnthropicMessage {
        role: role.to_owned(),
        content,
    }
}

fn part_to_native(part: &ContentPart) -> AnthropicContentBlock {
    match part {
        ContentPart::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
        ContentPart::Image { url, .. } => {
            let source = url
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(','))
                .map_or_else(
                    || AnthropicImageSource::Url { url: url.clone() },
                    |(mime, data)| AnthropicImageSource::Base64 {
                        media_type: mime.strip_suffix(";base64").unwrap_or(mime).to_owned(),
                        data: data.to_owned(),
                    },
                );
            AnthropicContentBlock::Image { source }
        }
    }
}

/// The Messages API rejects two consecutive messages with the same role,
/// which happens when several tool results follow one assistant turn
fn merge_consecutive(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut merged: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        match merged.last_mut() {
            Some(prev) if prev.role == msg.role => {
                let mut blocks = into_blocks(std::mem::replace(&mut prev.content, AnthropicContent::Blocks(Vec::new())));
                blocks.extend(into_blocks(msg.content));
                prev.content = AnthropicContent::Blocks(blocks);
            }
            _ => merged.push(msg),
        }
    }

    merged
}

fn into_blocks(content: AnthropicContent) -> Vec<AnthropicContentBlock> {
    match content {
        AnthropicContent::Text(text) => vec![AnthropicContentBlock::Text { text }],
        AnthropicContent::Blocks(blocks) => blocks,
    }
}

/// Anthropic has no "none" mode; tools are simply left to the model
fn tool_choice_to_native(choice: &ToolChoice) -> Option<AnthropicToolChoice> {
    match choice {
        ToolChoice::Mode(ToolChoiceMode::None) => None,
        ToolChoice::Mode(ToolChoiceMode::Auto) => Some(AnthropicToolChoice {
            choice_type: "auto".to_owned(),
            name: None,
        }),
        ToolChoice::Mode(ToolChoiceMode::Required) => Some(AnthropicToolChoice {
            choice_type: "any".to_owned(),
            name: None,
        }),
        ToolChoice::Function(forced) => Some(AnthropicToolChoice {
            choice_type: "tool".to_owned(),
            name: Some(forced.function.name.clone()),
        }),
    }
}

// -- Response --

/// Canonical response from a native Messages API reply
pub fn from_native(resp: AnthropicResponse) -> CompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            AnthropicResponseBlock::Text { text: chunk } => text.push_str(&chunk),
            AnthropicResponseBlock::ToolUse { id, name, input } => {
                let arguments = serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_owned());
                tool_calls.push(build_tool_call(id, name, arguments));
            }
            AnthropicResponseBlock::Other => {}
        }
    }

    let content = (!text.is_empty() || tool_calls.is_empty()).then_some(text);
    let finish_reason = resp.stop_reason.as_deref().and_then(FinishReason::parse);

    let mut response = CompletionResponse::single(
        resp.id,
        resp.model,
        ChoiceMessage::assistant(content, tool_calls),
        finish_reason,
    );
    response.usage = Some(Usage::new(resp.usage.input_tokens, resp.usage.output_tokens));
    response
}

// -- Streaming --

/// Per-stream state for mapping Anthropic events onto canonical deltas
///
/// Content block indices are shared by text and tool blocks, so tool calls
/// get their own sequential index.
#[derive(Debug, Default)]
pub struct AnthropicStreamState {
    current_tool_call_index: u32,
    next_tool_call_index: u32,
    input_tokens: u32,
}

impl AnthropicStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert one native event into zero or more canonical events
    ///
    /// # Errors
    ///
    /// Returns `LlmError::UpstreamUnavailable` for an in-band `error` event.
    pub fn convert_event(&mut self, backend: &str, event: AnthropicStreamEvent) -> Result<Vec<StreamEvent>, LlmError> {
        let events = match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.map_or(0, |u| u.input_tokens);
                Vec::new()
            }
            AnthropicStreamEvent::Ping | AnthropicStreamEvent::ContentBlockStop { .. } => Vec::new(),
            AnthropicStreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                AnthropicStreamContentBlock::Text { text } if !text.is_empty() => {
                    vec![StreamEvent::Delta(StreamDelta::text(text))]
                }
                AnthropicStreamContentBlock::ToolUse { id, name } => {
                    self.current_tool_call_index = self.next_tool_call_index;
                    self.next_tool_call_index += 1;
                    vec![self.tool_delta(Some(id), Some(name), None)]
                }
                AnthropicStreamContentBlock::Text { .. } | AnthropicStreamContentBlock::Other => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                AnthropicStreamDelta::TextDelta { text } => vec![StreamEvent::Delta(StreamDelta::text(text))],
                AnthropicStreamDelta::InputJsonDelta { partial_json } => {
                    vec![self.tool_delta(None, None, Some(partial_json))]
                }
                AnthropicStreamDelta::Other => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let mut events = Vec::new();
                if let Some(reason) = delta.stop_reason.as_deref().and_then(FinishReason::parse) {
                    events.push(StreamEvent::Delta(StreamDelta::finish(reason)));
                }
                if let Some(usage) = usage {
                    let input = if usage.input_tokens > 0 { usage.input_tokens } else { self.input_tokens };
                    events.push(StreamEvent::Usage(Usage::new(input, usage.output_tokens)));
                }
                events
            }
            AnthropicStreamEvent::MessageStop => vec![StreamEvent::Done],
            AnthropicStreamEvent::Error { error } => {
                return Err(LlmError::UpstreamUnavailable {
                    backend: backend.to_owned(),
                    message: format!("{}: {}", error.error_type, error.message),
                });
            }
        };

        Ok(events)
    }

    fn tool_delta(&self, id: Option<String>, name: Option<String>, arguments: Option<String>) -> StreamEvent {
        StreamEvent::Delta(StreamDelta {
            index: 0,
            content: None,
            tool_call: Some(StreamToolCall {
                index: self.current_tool_call_index,
                id,
                function: Some(StreamFunctionCall { name, arguments }),
            }),
            finish_reason: None,
        })
    }
}
