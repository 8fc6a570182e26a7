//! Transformation for the stateful conversation backend
//!
//! The backend already holds the history, so only the newest turn is
//! rendered into a prompt. Tools have no native representation and go
//! through the [`markup`](super::markup) convention instead.

use std::fmt::Write as _;

use super::markup::{self, MarkupStream, Piece};
use crate::error::LlmError;
use crate::protocol::threaded::{ThreadedStreamEvent, ThreadedUsage, TurnRequest, TurnResponse};
use crate::session::SessionContext;
use crate::types::{
    ChoiceMessage, CompletionRequest, CompletionResponse, Continuation, FinishReason, Role, StreamDelta, StreamEvent,
    StreamFunctionCall, StreamToolCall, ToolCall, ToolChoice, ToolChoiceMode, ToolDefinition, Usage,
};

/// Worked example shown ahead of the real turn when priming is enabled
const PRIMING_EXEMPLAR: &str = "<example>\n\
User: What is the weather in Paris?\n\
Assistant: <tool_call>{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Paris\"}}</tool_call>\n\
User: <tool_result id=\"call_example\">\n{\"temperature_c\": 18}\n</tool_result>\n\
Assistant: It is currently 18°C in Paris.\n\
</example>";

/// Build the turn request for the newest message of `req`
///
/// `session` is `None` or has no continuation token on the first turn of a
/// chain; only then is the system prompt sent.
///
/// # Errors
///
/// Returns `LlmError::InvalidRequest` if the history does not end with a
/// user message or tool results.
pub fn to_native(
    req: &CompletionRequest,
    session: Option<&SessionContext>,
    tool_priming: bool,
) -> Result<TurnRequest, LlmError> {
    let turn = render_turn(req)?;
    let first_turn = session.is_none_or(SessionContext::is_first_turn);

    let mut prompt = String::new();
    if req.has_tools() && !matches!(req.tool_choice, Some(ToolChoice::Mode(ToolChoiceMode::None))) {
        if let Some(tools) = &req.tools {
            prompt.push_str(&render_tools_preamble(tools, req.tool_choice.as_ref()));
            prompt.push_str("\n\n");
        }
        if tool_priming {
            prompt.push_str(PRIMING_EXEMPLAR);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str(&turn);

    let system = first_turn
        .then(|| {
            req.messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_text())
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .filter(|s| !s.is_empty());

    Ok(TurnRequest {
        model: req.model.clone(),
        prompt,
        parent_message_id: session.and_then(|s| s.continuation_token.clone()),
        system,
        stream: req.stream.then_some(true),
        temperature: req.params.temperature,
        top_p: req.params.top_p,
        max_tokens: req.params.max_tokens,
        stop: req.params.stop.clone(),
    })
}

/// Render the newest turn: trailing tool results, or the final user message
fn render_turn(req: &CompletionRequest) -> Result<String, LlmError> {
    let Some(last) = req.messages.last() else {
        return Err(LlmError::InvalidRequest("`messages` must not be empty".to_owned()));
    };

    match last.role {
        Role::User => Ok(last.content.as_text()),
        Role::Tool => {
            let trailing: Vec<String> = req
                .messages
                .iter()
                .rev()
                .take_while(|m| m.role == Role::Tool)
                .map(|m| markup::render_tool_result(m.tool_call_id.as_deref().unwrap_or_default(), &m.content.as_text()))
                .collect();
            Ok(trailing.into_iter().rev().collect::<Vec<_>>().join("\n"))
        }
        Role::Assistant | Role::System => Err(LlmError::InvalidRequest(
            "the last message must be a user message or tool result".to_owned(),
        )),
    }
}

fn render_tools_preamble(tools: &[ToolDefinition], choice: Option<&ToolChoice>) -> String {
    let mut out = String::from("<tools>\n");
    for tool in tools {
        let schema = serde_json::json!({
            "name": tool.function.name,
            "description": tool.function.description,
            "parameters": tool.function.parameters,
        });
        let _ = writeln!(out, "{schema}");
    }
    out.push_str("</tools>\n");
    out.push_str(
        "To call a tool, reply with <tool_call>{\"name\": \"<tool name>\", \"arguments\": {...}}</tool_call>. \
         Tool results are returned as <tool_result id=\"...\">...</tool_result>.",
    );

    match choice {
        Some(ToolChoice::Mode(ToolChoiceMode::Required)) => out.push_str(" You must call at least one tool."),
        Some(ToolChoice::Function(forced)) => {
            let _ = write!(out, " You must call the `{}` tool.", forced.function.name);
        }
        _ => {}
    }

    out
}

const fn usage_from_native(usage: ThreadedUsage) -> Usage {
    Usage::new(usage.input_tokens, usage.output_tokens)
}

/// Canonical response plus the continuation for the next turn
///
/// Tool call markup is only parsed when the request offered tools.
pub fn from_native(resp: TurnResponse, model: &str, parse_tools: bool) -> (CompletionResponse, Continuation) {
    let (text, tool_calls) = if parse_tools {
        markup::parse_tool_calls(&resp.content)
    } else {
        (resp.content, Vec::new())
    };

    let finish_reason = if tool_calls.is_empty() {
        resp.finish_reason.as_deref().and_then(FinishReason::parse).or(Some(FinishReason::Stop))
    } else {
        Some(FinishReason::ToolCalls)
    };
    let content = (!text.is_empty() || tool_calls.is_empty()).then_some(text);

    let mut response = CompletionResponse::single(
        format!("chatcmpl-{}", resp.message_id),
        model.to_owned(),
        ChoiceMessage::assistant(content, tool_calls),
        finish_reason,
    );
    response.usage = resp.usage.map(usage_from_native);

    let continuation = Continuation {
        conversation_id: resp.conversation_id,
        token: resp.message_id,
    };

    (response, continuation)
}

/// Per-stream state for a streamed turn
#[derive(Debug)]
pub struct ThreadedStreamState {
    backend: String,
    conversation_id: String,
    message_id: Option<String>,
    markup: Option<MarkupStream>,
    next_tool_index: u32,
}

impl ThreadedStreamState {
    pub fn new(backend: impl Into<String>, conversation_id: impl Into<String>, parse_tools: bool) -> Self {
        Self {
            backend: backend.into(),
            conversation_id: conversation_id.into(),
            message_id: None,
            markup: parse_tools.then(MarkupStream::new),
            next_tool_index: 0,
        }
    }

    /// Convert one native event into zero or more canonical events
    ///
    /// # Errors
    ///
    /// Returns `LlmError::UpstreamUnavailable` for an in-band `error` event
    /// and `LlmError::BadUpstreamResponse` if the turn finishes without a
    /// `start` event carrying its message id.
    pub fn convert_event(&mut self, event: ThreadedStreamEvent) -> Result<Vec<StreamEvent>, LlmError> {
        match event {
            ThreadedStreamEvent::Start { message_id } => {
                self.message_id = Some(message_id);
                Ok(Vec::new())
            }
            ThreadedStreamEvent::Delta { content } => Ok(self.text(&content)),
            ThreadedStreamEvent::Finish { finish_reason, usage } => self.finish(finish_reason.as_deref(), usage),
            ThreadedStreamEvent::Error { message } => Err(LlmError::UpstreamUnavailable {
                backend: self.backend.clone(),
                message,
            }),
        }
    }

    fn text(&mut self, content: &str) -> Vec<StreamEvent> {
        let Some(markup) = &mut self.markup else {
            return vec![StreamEvent::Delta(StreamDelta::text(content))];
        };

        let pieces = markup.push(content);
        pieces
            .into_iter()
            .map(|piece| match piece {
                Piece::Text(text) => StreamEvent::Delta(StreamDelta::text(text)),
                Piece::ToolCall(call) => self.tool_call_delta(call),
            })
            .collect()
    }

    fn tool_call_delta(&mut self, call: ToolCall) -> StreamEvent {
        let index = self.next_tool_index;
        self.next_tool_index += 1;
        StreamEvent::Delta(StreamDelta {
            index: 0,
            content: None,
            tool_call: Some(StreamToolCall {
                index,
                id: Some(call.id),
                function: Some(StreamFunctionCall {
                    name: Some(call.function.name),
                    arguments: Some(call.function.arguments),
                }),
            }),
            finish_reason: None,
        })
    }

    fn finish(&mut self, finish_reason: Option<&str>, usage: Option<ThreadedUsage>) -> Result<Vec<StreamEvent>, LlmError> {
        let Some(token) = self.message_id.take() else {
            return Err(LlmError::BadUpstreamResponse {
                backend: self.backend.clone(),
                message: "stream finished without a message id".to_owned(),
                raw: String::new(),
            });
        };

        // Continuation first: it must be committed before the caller sees
        // the finish reason.
        let mut events = vec![StreamEvent::Continuation(Continuation {
            conversation_id: self.conversation_id.clone(),
            token,
        })];
        if let Some(rest) = self.markup.as_mut().and_then(MarkupStream::finish) {
            events.push(StreamEvent::Delta(StreamDelta::text(rest)));
        }

        let reason = if self.next_tool_index > 0 {
            FinishReason::ToolCalls
        } else {
            finish_reason.and_then(FinishReason::parse).unwrap_or(FinishReason::Stop)
        };
        events.push(StreamEvent::Delta(StreamDelta::finish(reason)));

        if let Some(usage) = usage {
            events.push(StreamEvent::Usage(usage_from_native(usage)));
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{CompletionParams, FunctionCall, FunctionDefinition, Message};

    fn request(messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest {
            model: "thread-1".to_owned(),
            messages,
            params: CompletionParams::default(),
            tools: None,
            tool_choice: None,
            stream: false,
            backend: None,
            session_id: None,
        }
    }

    fn continuing(token: &str) -> SessionContext {
        SessionContext {
            conversation_key: "ck:x".to_owned(),
            conversation_id: Some("conv-1".to_owned()),
            continuation_token: Some(token.to_owned()),
        }
    }

    fn weather_tool() -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_owned(),
            function: FunctionDefinition {
                name: "get_weather".to_owned(),
                description: Some("Current weather".to_owned()),
                parameters: Some(json!({"type": "object"})),
            },
        }
    }

    #[test]
    fn first_turn_sends_system_and_null_parent() {
        let req = request(vec![
            Message::text(Role::System, "be brief"),
            Message::text(Role::User, "hi"),
        ]);
        let turn = to_native(&req, None, false).unwrap();

        assert_eq!(turn.prompt, "hi");
        assert_eq!(turn.system.as_deref(), Some("be brief"));
        let value = serde_json::to_value(&turn).unwrap();
        assert!(value["parent_message_id"].is_null());
    }

    #[test]
    fn later_turn_sends_only_newest_message_and_token() {
        let req = request(vec![
            Message::text(Role::System, "be brief"),
            Message::text(Role::User, "hi"),
            Message::text(Role::Assistant, "hello"),
            Message::text(Role::User, "how are you?"),
        ]);
        let turn = to_native(&req, Some(&continuing("msg-7")), false).unwrap();

        assert_eq!(turn.prompt, "how are you?");
        assert_eq!(turn.parent_message_id.as_deref(), Some("msg-7"));
        assert!(turn.system.is_none());
    }

    #[test]
    fn trailing_tool_results_are_rendered_in_order() {
        let mut assistant = Message::text(Role::Assistant, "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_a".into(),
            function: FunctionCall {
                name: "get_weather".into(),
                arguments: "{}".into(),
            },
        }]);
        let req = request(vec![
            Message::text(Role::User, "weather?"),
            assistant,
            Message::tool_result("call_a", "sunny"),
            Message::tool_result("call_b", "windy"),
        ]);

        let turn = to_native(&req, Some(&continuing("msg-1")), false).unwrap();
        let a = turn.prompt.find("id=\"call_a\"").unwrap();
        let b = turn.prompt.find("id=\"call_b\"").unwrap();
        assert!(a < b);
        assert!(turn.prompt.contains("sunny"));
        assert!(!turn.prompt.contains("weather?"));
    }

    #[test]
    fn trailing_assistant_message_is_rejected() {
        let req = request(vec![Message::text(Role::User, "hi"), Message::text(Role::Assistant, "hello")]);
        let err = to_native(&req, None, false).unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[test]
    fn priming_is_added_only_with_tools_and_flag() {
        let mut req = request(vec![Message::text(Role::User, "weather in Oslo?")]);
        assert!(!to_native(&req, None, true).unwrap().prompt.contains("<example>"));

        req.tools = Some(vec![weather_tool()]);
        let unprimed = to_native(&req, None, false).unwrap();
        assert!(unprimed.prompt.starts_with("<tools>"));
        assert!(!unprimed.prompt.contains("<example>"));

        let primed = to_native(&req, None, true).unwrap();
        let example = primed.prompt.find("<example>").unwrap();
        let question = primed.prompt.find("weather in Oslo?").unwrap();
        assert!(example < question);
    }

    #[test]
    fn response_markup_becomes_tool_calls() {
        let resp = TurnResponse {
            conversation_id: "conv-1".into(),
            message_id: "msg-2".into(),
            content: "<tool_call>{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Oslo\"}}</tool_call>".into(),
            finish_reason: Some("stop".into()),
            usage: Some(ThreadedUsage {
                input_tokens: 4,
                output_tokens: 6,
            }),
        };

        let (response, continuation) = from_native(resp, "thread-1", true);
        let choice = &response.choices[0];
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert!(choice.message.content.is_none());
        assert_eq!(choice.message.tool_calls.as_ref().unwrap()[0].function.name, "get_weather");
        assert_eq!(continuation.token, "msg-2");
        assert_eq!(response.usage.unwrap().total_tokens, 10);
    }

    #[test]
    fn markup_is_left_alone_without_tools() {
        let resp = TurnResponse {
            conversation_id: "conv-1".into(),
            message_id: "msg-2".into(),
            content: "<tool_call>{\"name\": \"x\"}</tool_call>".into(),
            finish_reason: None,
            usage: None,
        };
        let (response, _) = from_native(resp, "thread-1", false);
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(response.choices[0].message.content.as_deref().unwrap().contains("<tool_call>"));
    }

    #[test]
    fn continuation_precedes_finish() {
        let mut state = ThreadedStreamState::new("threaded", "conv-1", true);
        let mut events = Vec::new();
        for event in [
            ThreadedStreamEvent::Start {
                message_id: "msg-9".into(),
            },
            ThreadedStreamEvent::Delta {
                content: "ok <tool_".into(),
            },
            ThreadedStreamEvent::Delta {
                content: "call>{\"name\":\"f\"}</tool_call>".into(),
            },
            ThreadedStreamEvent::Finish {
                finish_reason: Some("stop".into()),
                usage: None,
            },
        ] {
            events.extend(state.convert_event(event).unwrap());
        }

        assert_eq!(events[0], StreamEvent::Delta(StreamDelta::text("ok ")));
        assert!(matches!(&events[1], StreamEvent::Delta(d) if d.tool_call.is_some()));
        assert_eq!(
            events[2],
            StreamEvent::Continuation(Continuation {
                conversation_id: "conv-1".into(),
                token: "msg-9".into(),
            })
        );
        assert_eq!(events[3], StreamEvent::Delta(StreamDelta::finish(FinishReason::ToolCalls)));
    }

    #[test]
    fn usage_trails_the_continuation() {
        let mut state = ThreadedStreamState::new("threaded", "conv-1", false);
        state
            .convert_event(ThreadedStreamEvent::Start {
                message_id: "msg-2".into(),
            })
            .unwrap();
        let events = state
            .convert_event(ThreadedStreamEvent::Finish {
                finish_reason: Some("length".into()),
                usage: Some(ThreadedUsage {
                    input_tokens: 4,
                    output_tokens: 2,
                }),
            })
            .unwrap();

        assert!(matches!(&events[0], StreamEvent::Continuation(c) if c.token == "msg-2"));
        assert_eq!(events[1], StreamEvent::Delta(StreamDelta::finish(FinishReason::Length)));
        assert!(matches!(events[2], StreamEvent::Usage(_)));
    }

    #[test]
    fn finish_without_start_is_a_bad_response() {
        let mut state = ThreadedStreamState::new("threaded", "conv-1", false);
        let err = state
            .convert_event(ThreadedStreamEvent::Finish {
                finish_reason: None,
                usage: None,
            })
            .unwrap_err();
        assert!(matches!(err, LlmError::BadUpstreamResponse { .. }));
    }
}
