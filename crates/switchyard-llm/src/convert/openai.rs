//! `OpenAI` wire format conversions
//!
//! Used in both directions: inbound public requests and outbound responses
//! to callers, and outbound requests to `openai`-kind backends.

use crate::protocol::openai::{
    OpenAiChoice, OpenAiChoiceMessage, OpenAiContent, OpenAiContentPart, OpenAiFunction, OpenAiFunctionCall,
    OpenAiImageUrl, OpenAiMessage, OpenAiRequest, OpenAiResponse, OpenAiStreamChoice, OpenAiStreamChunk,
    OpenAiStreamDelta, OpenAiStreamFunctionCall, OpenAiStreamToolCall, OpenAiTool, OpenAiToolCall, OpenAiUsage,
    StopSequences,
};
use crate::types::{
    Choice, ChoiceMessage, CompletionParams, CompletionRequest, CompletionResponse, Content, ContentPart,
    FinishReason, FunctionCall, FunctionDefinition, Message, Role, StreamDelta, StreamEvent, StreamFunctionCall,
    StreamToolCall, ToolCall, ToolChoice, ToolChoiceFunction, ToolChoiceMode, ToolDefinition, Usage,
};

// -- Public request -> canonical --

impl From<OpenAiRequest> for CompletionRequest {
    fn from(req: OpenAiRequest) -> Self {
        Self {
            model: req.model,
            messages: req.messages.into_iter().map(Into::into).collect(),
            params: CompletionParams {
                temperature: req.temperature,
                top_p: req.top_p,
                max_tokens: req.max_tokens,
                stop: req.stop.map(StopSequences::into_vec),
                frequency_penalty: req.frequency_penalty,
                presence_penalty: req.presence_penalty,
                seed: req.seed,
            },
            tools: req.tools.map(|tools| {
                tools
                    .into_iter()
                    .map(|t| ToolDefinition {
                        tool_type: t.tool_type,
                        function: FunctionDefinition {
                            name: t.function.name,
                            description: t.function.description,
                            parameters: t.function.parameters,
                        },
                    })
                    .collect()
            }),
            tool_choice: req.tool_choice.as_ref().and_then(parse_tool_choice),
            stream: req.stream.unwrap_or(false),
            backend: req.backend.filter(|b| !b.is_empty()),
            session_id: req.session_id.filter(|s| !s.is_empty()),
        }
    }
}

impl From<OpenAiMessage> for Message {
    fn from(msg: OpenAiMessage) -> Self {
        let role = match msg.role.as_str() {
            "system" | "developer" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        };

        let content = match msg.content {
            Some(OpenAiContent::Text(text)) => Content::Text(text),
            Some(OpenAiContent::Parts(parts)) => Content::Parts(
                parts
                    .into_iter()
                    .map(|part| match part {
                        OpenAiContentPart::Text { text } => ContentPart::Text { text },
                        OpenAiContentPart::ImageUrl { image_url } => ContentPart::Image {
                            url: image_url.url,
                            detail: image_url.detail,
                        },
                    })
                    .collect(),
            ),
            None => Content::Text(String::new()),
        };

        Self {
            role,
            content,
            name: msg.name,
            tool_calls: msg.tool_calls.map(|calls| calls.into_iter().map(tool_call_from_wire).collect()),
            tool_call_id: msg.tool_call_id,
        }
    }
}

fn tool_call_from_wire(call: OpenAiToolCall) -> ToolCall {
    ToolCall {
        id: call.id,
        function: FunctionCall {
            name: call.function.name,
            arguments: call.function.arguments,
        },
    }
}

fn tool_call_to_wire(call: &ToolCall) -> OpenAiToolCall {
    OpenAiToolCall {
        id: call.id.clone(),
        tool_type: "function".to_owned(),
        function: OpenAiFunctionCall {
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
        },
    }
}

fn parse_tool_choice(value: &serde_json::Value) -> Option<ToolChoice> {
    match value {
        serde_json::Value::String(mode) => match mode.as_str() {
            "none" => Some(ToolChoice::Mode(ToolChoiceMode::None)),
            "auto" => Some(ToolChoice::Mode(ToolChoiceMode::Auto)),
            "required" => Some(ToolChoice::Mode(ToolChoiceMode::Required)),
            _ => None,
        },
        serde_json::Value::Object(_) => serde_json::from_value::<ToolChoiceFunction>(value.clone())
            .ok()
            .map(ToolChoice::Function),
        _ => None,
    }
}

fn tool_choice_value(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Mode(ToolChoiceMode::None) => "none".into(),
        ToolChoice::Mode(ToolChoiceMode::Auto) => "auto".into(),
        ToolChoice::Mode(ToolChoiceMode::Required) => "required".into(),
        ToolChoice::Function(forced) => serde_json::json!({
            "type": forced.tool_type,
            "function": { "name": forced.function.name },
        }),
    }
}

// -- Canonical request -> upstream `openai` backend --

/// Build the native request for an `openai` backend
///
/// The full message list is passed through unchanged. Gateway extension
/// fields are never forwarded.
pub fn to_native(req: &CompletionRequest, include_usage: bool) -> OpenAiRequest {
    OpenAiRequest {
        model: req.model.clone(),
        messages: req.messages.iter().map(Into::into).collect(),
        temperature: req.params.temperature,
        top_p: req.params.top_p,
        max_tokens: req.params.max_tokens,
        stop: req.params.stop.clone().map(StopSequences::Many),
        frequency_penalty: req.params.frequency_penalty,
        presence_penalty: req.params.presence_penalty,
        seed: req.params.seed,
        stream: req.stream.then_some(true),
        tools: req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| OpenAiTool {
                    tool_type: t.tool_type.clone(),
                    function: OpenAiFunction {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        parameters: t.function.parameters.clone(),
                    },
                })
                .collect()
        }),
        tool_choice: req.tool_choice.as_ref().map(tool_choice_value),
        stream_options: (req.stream && include_usage)
            .then_some(crate::protocol::openai::OpenAiStreamOptions { include_usage: true }),
        backend: None,
        session_id: None,
    }
}

impl From<&Message> for OpenAiMessage {
    fn from(msg: &Message) -> Self {
        let content = match &msg.content {
            Content::Text(text) => OpenAiContent::Text(text.clone()),
            Content::Parts(parts) => OpenAiContent::Parts(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => OpenAiContentPart::Text { text: text.clone() },
                        ContentPart::Image { url, detail } => OpenAiContentPart::ImageUrl {
                            image_url: OpenAiImageUrl {
                                url: url.clone(),
                                detail: detail.clone(),
                            },
                        },
                    })
                    .collect(),
            ),
        };

        Self {
            role: msg.role.as_str().to_owned(),
            content: Some(content),
            name: msg.name.clone(),
            tool_calls: msg.tool_calls.as_ref().map(|calls| calls.iter().map(tool_call_to_wire).collect()),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

// -- Responses --

impl From<OpenAiResponse> for CompletionResponse {
    fn from(resp: OpenAiResponse) -> Self {
        Self {
            id: resp.id,
            object: resp.object,
            created: resp.created,
            model: resp.model,
            choices: resp
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: ChoiceMessage {
                        role: c.message.role,
                        content: c.message.content,
                        tool_calls: c
                            .message
                            .tool_calls
                            .map(|calls| calls.into_iter().map(tool_call_from_wire).collect()),
                    },
                    finish_reason: c.finish_reason.as_deref().and_then(FinishReason::parse),
                })
                .collect(),
            usage: resp.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        }
    }
}

impl From<&CompletionResponse> for OpenAiResponse {
    fn from(resp: &CompletionResponse) -> Self {
        Self {
            id: resp.id.clone(),
            object: resp.object.clone(),
            created: resp.created,
            model: resp.model.clone(),
            choices: resp
                .choices
                .iter()
                .map(|choice| OpenAiChoice {
                    index: choice.index,
                    message: OpenAiChoiceMessage {
                        role: choice.message.role.clone(),
                        content: choice.message.content.clone(),
                        tool_calls: choice
                            .message
                            .tool_calls
                            .as_ref()
                            .map(|calls| calls.iter().map(tool_call_to_wire).collect()),
                    },
                    finish_reason: choice.finish_reason.map(|r| r.as_str().to_owned()),
                })
                .collect(),
            usage: resp.usage.map(usage_to_wire),
        }
    }
}

const fn usage_to_wire(usage: Usage) -> OpenAiUsage {
    OpenAiUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

// -- Streams --

/// Convert one upstream chunk into canonical events, preserving choice order
pub fn chunk_to_events(chunk: &OpenAiStreamChunk) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    for choice in &chunk.choices {
        let finish_reason = choice.finish_reason.as_deref().and_then(FinishReason::parse);
        let tool_calls = choice.delta.tool_calls.as_deref().unwrap_or_default();

        if tool_calls.is_empty() {
            events.push(StreamEvent::Delta(StreamDelta {
                index: choice.index,
                content: choice.delta.content.clone(),
                tool_call: None,
                finish_reason,
            }));
            continue;
        }

        // One canonical delta per tool call fragment; text and finish
        // reason ride on the first and last respectively
        let last = tool_calls.len() - 1;
        for (i, call) in tool_calls.iter().enumerate() {
            events.push(StreamEvent::Delta(StreamDelta {
                index: choice.index,
                content: if i == 0 { choice.delta.content.clone() } else { None },
                tool_call: Some(StreamToolCall {
                    index: call.index,
                    id: call.id.clone(),
                    function: call.function.as_ref().map(|f| StreamFunctionCall {
                        name: f.name.clone(),
                        arguments: f.arguments.clone(),
                    }),
                }),
                finish_reason: if i == last { finish_reason } else { None },
            }));
        }
    }

    if let Some(usage) = &chunk.usage {
        events.push(StreamEvent::Usage(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }));
    }

    events
}

/// Frame a canonical delta as a public stream chunk
pub fn delta_to_chunk(delta: &StreamDelta, id: &str, model: &str, created: u64, first: bool) -> OpenAiStreamChunk {
    let tool_calls = delta.tool_call.as_ref().map(|call| {
        vec![OpenAiStreamToolCall {
            index: call.index,
            id: call.id.clone(),
            tool_type: call.id.as_ref().map(|_| "function".to_owned()),
            function: call.function.as_ref().map(|f| OpenAiStreamFunctionCall {
                name: f.name.clone(),
                arguments: f.arguments.clone(),
            }),
        }]
    });

    OpenAiStreamChunk {
        id: id.to_owned(),
        object: "chat.completion.chunk".to_owned(),
        created,
        model: model.to_owned(),
        choices: vec![OpenAiStreamChoice {
            index: delta.index,
            delta: OpenAiStreamDelta {
                role: first.then(|| "assistant".to_owned()),
                content: delta.content.clone(),
                tool_calls,
            },
            finish_reason: delta.finish_reason.map(|r| r.as_str().to_owned()),
        }],
        usage: None,
    }
}

/// Frame final usage as a choiceless public stream chunk
pub fn usage_to_chunk(usage: Usage, id: &str, model: &str, created: u64) -> OpenAiStreamChunk {
    OpenAiStreamChunk {
        id: id.to_owned(),
        object: "chat.completion.chunk".to_owned(),
        created,
        model: model.to_owned(),
        choices: Vec::new(),
        usage: Some(usage_to_wire(usage)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn public_request(body: serde_json::Value) -> CompletionRequest {
        serde_json::from_value::<OpenAiRequest>(body).unwrap().into()
    }

    #[test]
    fn public_request_keeps_every_message() {
        let req = public_request(json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "temperature": 0.2,
            "stop": "END"
        }));

        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.params.stop, Some(vec!["END".to_owned()]));

        let native = to_native(&req, false);
        let value = serde_json::to_value(&native).unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 2);
        assert_eq!(value["messages"][1]["content"], "hello");
        assert!(value.get("stream_options").is_none());
    }

    #[test]
    fn extension_fields_are_read_but_not_forwarded() {
        let req = public_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "backend": "primary",
            "session_id": "chat-1"
        }));
        assert_eq!(req.backend.as_deref(), Some("primary"));
        assert_eq!(req.session_id.as_deref(), Some("chat-1"));

        let value = serde_json::to_value(to_native(&req, false)).unwrap();
        assert!(value.get("backend").is_none());
        assert!(value.get("session_id").is_none());
    }

    #[test]
    fn usage_requested_only_when_streaming_to_canonical_host() {
        let mut req = public_request(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}));
        req.stream = true;
        assert!(to_native(&req, true).stream_options.is_some());
        assert!(to_native(&req, false).stream_options.is_none());
    }

    #[test]
    fn tool_calls_survive_round_trip_through_history() {
        let req = public_request(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "weather", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {"name": "weather"}}],
            "tool_choice": "required"
        }));

        assert_eq!(req.tool_choice, Some(ToolChoice::Mode(ToolChoiceMode::Required)));
        let value = serde_json::to_value(to_native(&req, false)).unwrap();
        assert_eq!(value["messages"][1]["tool_calls"][0]["function"]["name"], "weather");
        assert_eq!(value["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(value["tool_choice"], "required");
    }

    #[test]
    fn response_keeps_assistant_role() {
        let wire: OpenAiResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }))
        .unwrap();

        let resp = CompletionResponse::from(wire);
        assert_eq!(resp.choices[0].message.role, "assistant");
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));

        let public = OpenAiResponse::from(&resp);
        assert_eq!(public.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(public.usage.unwrap().total_tokens, 4);
    }

    #[test]
    fn multi_tool_chunk_splits_into_ordered_deltas() {
        let chunk: OpenAiStreamChunk = serde_json::from_value(json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "a", "type": "function", "function": {"name": "x", "arguments": ""}},
                {"index": 1, "id": "b", "type": "function", "function": {"name": "y", "arguments": ""}}
            ]}, "finish_reason": "tool_calls"}]
        }))
        .unwrap();

        let events = chunk_to_events(&chunk);
        assert_eq!(events.len(), 2);
        let StreamEvent::Delta(first) = &events[0] else { panic!("expected delta") };
        let StreamEvent::Delta(second) = &events[1] else { panic!("expected delta") };
        assert_eq!(first.tool_call.as_ref().unwrap().index, 0);
        assert!(first.finish_reason.is_none());
        assert_eq!(second.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn first_public_chunk_carries_role() {
        let chunk = delta_to_chunk(&StreamDelta::text("hi"), "id", "m", 1, true);
        assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
        let later = delta_to_chunk(&StreamDelta::text("!"), "id", "m", 1, false);
        assert!(later.choices[0].delta.role.is_none());
    }
}
