//! Scripted in-process backend shared by unit tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use switchyard_config::BackendKind;

use crate::backend::{Backend, BackendDescriptor, Exchange, StreamStart};
use crate::error::LlmError;
use crate::session::SessionContext;
use crate::types::{
    ChoiceMessage, CompletionParams, CompletionRequest, CompletionResponse, Continuation, FinishReason, Message, Role,
    StreamDelta, StreamEvent, Usage,
};

pub fn descriptor(id: &str, priority: i32, models: &[&str]) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_owned(),
        kind: BackendKind::Openai,
        enabled: true,
        priority,
        base_url: None,
        api_key: None,
        timeout: Duration::from_secs(5),
        models: models.iter().map(|m| (*m).to_owned()).collect(),
        default_model: models.first().map(|m| (*m).to_owned()),
        tool_priming: false,
    }
}

pub fn threaded_descriptor(id: &str, priority: i32, models: &[&str]) -> BackendDescriptor {
    BackendDescriptor {
        kind: BackendKind::Threaded,
        ..descriptor(id, priority, models)
    }
}

pub fn request(model: &str, messages: Vec<Message>) -> CompletionRequest {
    CompletionRequest {
        model: model.to_owned(),
        messages,
        params: CompletionParams::default(),
        tools: None,
        tool_choice: None,
        stream: false,
        backend: None,
        session_id: None,
    }
}

pub fn user(text: &str) -> Message {
    Message::text(Role::User, text)
}

pub fn assistant(text: &str) -> Message {
    Message::text(Role::Assistant, text)
}

/// What the next call does
pub enum Outcome {
    Reply(String),
    Fail(LlmError),
    /// Stream one delta, then fail
    FailMidStream(String),
    /// Stream one delta, then go silent
    StallMidStream(String),
    Hang,
}

/// A call as the backend saw it
#[derive(Debug, Clone)]
pub struct SeenCall {
    pub request: CompletionRequest,
    pub session: Option<SessionContext>,
}

/// Backend that replays queued outcomes, replying `"ok from {id}"` when the
/// queue is empty
///
/// Threaded descriptors continue the caller's conversation and mint a new
/// `msg-{n}` token per turn.
pub struct ScriptedBackend {
    descriptor: BackendDescriptor,
    outcomes: Mutex<VecDeque<Outcome>>,
    seen: Mutex<Vec<SeenCall>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            outcomes: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: Outcome) -> &Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }

    fn next(&self, request: &CompletionRequest, session: Option<&SessionContext>) -> (Outcome, Option<Continuation>) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(SeenCall {
            request: request.clone(),
            session: session.cloned(),
        });

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Outcome::Reply(format!("ok from {}", self.descriptor.id)));

        let continuation = self.is_stateful().then(|| Continuation {
            conversation_id: session
                .and_then(|s| s.conversation_id.clone())
                .unwrap_or_else(|| format!("conv-{}", self.descriptor.id)),
            token: format!("msg-{n}"),
        });

        (outcome, continuation)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn complete(&self, request: &CompletionRequest, session: Option<&SessionContext>) -> Result<Exchange, LlmError> {
        let (outcome, continuation) = self.next(request, session);
        let text = match outcome {
            Outcome::Reply(text) => text,
            Outcome::Fail(e) => return Err(e),
            Outcome::FailMidStream(_) | Outcome::StallMidStream(_) => {
                return Err(LlmError::UpstreamUnavailable {
                    backend: self.descriptor.id.clone(),
                    message: "dropped".to_owned(),
                });
            }
            Outcome::Hang => std::future::pending().await,
        };

        let mut response = CompletionResponse::single(
            format!("chatcmpl-{}", self.descriptor.id),
            request.model.clone(),
            ChoiceMessage::assistant(Some(text.clone()), Vec::new()),
            Some(FinishReason::Stop),
        );
        response.usage = Some(Usage::new(3, 2));

        Ok(Exchange {
            response,
            native_request: serde_json::json!({ "model": request.model }),
            native_response: serde_json::json!({ "text": text }),
            continuation,
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<StreamStart, LlmError> {
        let (outcome, continuation) = self.next(request, session);
        let native_request = serde_json::json!({ "model": request.model, "stream": true });

        let events: Vec<Result<StreamEvent, LlmError>> = match outcome {
            Outcome::Reply(text) => {
                let mut events: Vec<_> = text
                    .split_inclusive(' ')
                    .map(|word| Ok(StreamEvent::Delta(StreamDelta::text(word))))
                    .collect();
                if let Some(continuation) = continuation {
                    events.push(Ok(StreamEvent::Continuation(continuation)));
                }
                events.push(Ok(StreamEvent::Delta(StreamDelta::finish(FinishReason::Stop))));
                events.push(Ok(StreamEvent::Usage(Usage::new(3, 2))));
                events.push(Ok(StreamEvent::Done));
                events
            }
            Outcome::Fail(e) => return Err(e),
            Outcome::FailMidStream(text) => vec![
                Ok(StreamEvent::Delta(StreamDelta::text(text))),
                Err(LlmError::UpstreamUnavailable {
                    backend: self.descriptor.id.clone(),
                    message: "connection reset".to_owned(),
                }),
                Ok(StreamEvent::Delta(StreamDelta::text("never relayed"))),
            ],
            Outcome::StallMidStream(text) => {
                let first = Ok::<_, LlmError>(StreamEvent::Delta(StreamDelta::text(text)));
                return Ok(StreamStart {
                    native_request,
                    events: Box::pin(stream::iter([first]).chain(stream::pending())),
                });
            }
            Outcome::Hang => std::future::pending().await,
        };

        Ok(StreamStart {
            native_request,
            events: Box::pin(stream::iter(events)),
        })
    }

    async fn probe(&self) -> Result<(), LlmError> {
        Ok(())
    }
}
