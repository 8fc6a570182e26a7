//! `<tool_call>` markup convention for backends without native tool calling
//!
//! The model is told to answer with
//! `<tool_call>{"name": "...", "arguments": {...}}</tool_call>`; these tags
//! are parsed back out of complete responses and out of streamed text.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::types::ToolCall;
use crate::types::response::build_tool_call;

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

#[allow(clippy::expect_used)]
static TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("must be valid regex"));

#[derive(Deserialize)]
struct MarkupCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Parse a tag body into a tool call, `None` if it is not valid call JSON
fn parse_call(body: &str) -> Option<ToolCall> {
    let call: MarkupCall = serde_json::from_str(body.trim()).ok()?;
    if call.name.trim().is_empty() {
        return None;
    }

    let arguments = match call.arguments {
        serde_json::Value::Null => "{}".to_owned(),
        // Some models double-encode the arguments
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    };

    Some(build_tool_call(new_call_id(), call.name, arguments))
}

/// Split a complete response into remaining text and parsed tool calls
///
/// Tags whose body is not valid call JSON are left in the text untouched.
pub fn parse_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    let mut remaining = String::with_capacity(text.len());
    let mut last = 0;

    for captures in TOOL_CALL_RE.captures_iter(text) {
        let (Some(whole), Some(body)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        if let Some(call) = parse_call(body.as_str()) {
            remaining.push_str(&text[last..whole.start()]);
            last = whole.end();
            calls.push(call);
        }
    }
    remaining.push_str(&text[last..]);

    let remaining = if calls.is_empty() { remaining } else { remaining.trim().to_owned() };
    (remaining, calls)
}

/// Render a tool result for the next prompt
pub fn render_tool_result(id: &str, content: &str) -> String {
    format!("<tool_result id=\"{id}\">\n{content}\n</tool_result>")
}

/// Output of [`MarkupStream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Text(String),
    ToolCall(ToolCall),
}

/// Incremental tag parser for streamed text
///
/// Text that could be the start of a tag is held back until enough input
/// arrives to decide, so a tag split across chunks is never leaked.
#[derive(Debug, Default)]
pub struct MarkupStream {
    buffer: String,
}

impl MarkupStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Piece> {
        self.buffer.push_str(chunk);
        let mut pieces = Vec::new();

        loop {
            let Some(start) = self.buffer.find(OPEN_TAG) else {
                let keep = partial_suffix_len(&self.buffer, OPEN_TAG);
                let emit = self.buffer.len() - keep;
                if emit > 0 {
                    pieces.push(Piece::Text(self.buffer.drain(..emit).collect()));
                }
                break;
            };

            if start > 0 {
                pieces.push(Piece::Text(self.buffer.drain(..start).collect()));
            }

            // Buffer now starts with an open tag
            let Some(close) = self.buffer.find(CLOSE_TAG) else {
                break;
            };

            let end = close + CLOSE_TAG.len();
            let tag: String = self.buffer.drain(..end).collect();
            let body = &tag[OPEN_TAG.len()..tag.len() - CLOSE_TAG.len()];
            match parse_call(body) {
                Some(call) => pieces.push(Piece::ToolCall(call)),
                None => pieces.push(Piece::Text(tag)),
            }
        }

        merge_text(pieces)
    }

    /// Flush whatever is buffered as plain text
    pub fn finish(&mut self) -> Option<String> {
        (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer))
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    (1..tag.len().min(text.len() + 1))
        .rev()
        .find(|&n| text.is_char_boundary(text.len() - n) && text.ends_with(&tag[..n]))
        .unwrap_or(0)
}

fn merge_text(pieces: Vec<Piece>) -> Vec<Piece> {
    let mut merged: Vec<Piece> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let (Some(Piece::Text(prev)), Piece::Text(next)) = (merged.last_mut(), &piece) {
            prev.push_str(next);
        } else {
            merged.push(piece);
        }
    }
    merged
}
