//! Router: candidate selection, priority fallback and session bookkeeping

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{StreamExt, stream};
use jiff::Timestamp;
use switchyard_audit::AuditSink;
use switchyard_core::RequestContext;
use switchyard_store::{AttemptRecord, ExchangeRecord, ExchangeUsage};
use uuid::Uuid;

use crate::backend::{Backend, EventStream, Exchange, StreamStart};
use crate::error::{Attempt, LlmError};
use crate::registry::{ModelEntry, Registry};
use crate::session::{SessionContext, SessionManager, TurnGuard, key};
use crate::types::{CompletionRequest, CompletionResponse, FinishReason, StreamEvent, Usage};

/// Routes public requests across the active backends
pub struct RequestRouter {
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    audit: AuditSink,
    default_backend: Option<String>,
}

/// A stream committed to one backend
pub struct RoutedStream {
    pub backend: String,
    /// Model name as requested by the caller
    pub model: String,
    /// Canonical events ending in `Done` or a single error
    pub events: EventStream,
}

impl std::fmt::Debug for RoutedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedStream")
            .field("backend", &self.backend)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Ordered candidates for one inbound request
struct Candidates {
    backends: Vec<Arc<dyn Backend>>,
    /// Caller named the backend; no fallback and no circuit check
    pinned: bool,
}

/// A stream whose first event has arrived
struct OpenedStream {
    backend: String,
    /// Per-event bound for the rest of the stream
    timeout: Duration,
    first: StreamEvent,
    events: EventStream,
    turn: Option<TurnGuard>,
}

/// Conversation identity used by stateful candidates
struct Conversation {
    key: Option<String>,
    restart: bool,
}

impl Conversation {
    fn of(request: &CompletionRequest) -> Self {
        match request.session_id.as_deref() {
            Some(id) => Self {
                key: Some(key::explicit(id)),
                restart: false,
            },
            // Without an assistant reply the history can only be a first turn
            None => Self {
                key: key::derive(&request.messages),
                restart: !request.has_assistant_turn(),
            },
        }
    }

    fn key(&self) -> Result<&str, LlmError> {
        self.key.as_deref().ok_or_else(|| {
            LlmError::InvalidRequest("stateful backends need a user message or an explicit session id".to_owned())
        })
    }
}

impl RequestRouter {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
        audit: AuditSink,
        default_backend: Option<String>,
    ) -> Self {
        Self {
            registry,
            sessions,
            audit,
            default_backend,
        }
    }

    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub const fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub const fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Answer a non-streaming request, falling back across candidates
    pub async fn complete(
        &self,
        mut request: CompletionRequest,
        context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        merge_context(&mut request, context);
        let mut audit = AuditDraft::new(self.audit.clone(), context, &request);

        let result = self.complete_inner(&request, &mut audit).await;
        match result {
            Ok(ref response) => audit.succeed(serde_json::to_value(response).ok(), response.usage),
            Err(ref e) => audit.fail(e),
        }
        audit.submit();

        result
    }

    async fn complete_inner(
        &self,
        request: &CompletionRequest,
        audit: &mut AuditDraft,
    ) -> Result<CompletionResponse, LlmError> {
        let (upstream_request, candidates, conversation) = self.plan(request)?;
        let mut attempts = Vec::new();

        for backend in candidates.backends {
            let id = backend.id().to_owned();
            if !candidates.pinned && !self.registry.health().is_available(&id) {
                tracing::debug!(backend = %id, "skipping backend with open circuit");
                attempts.push(attempt(&LlmError::CircuitOpen { backend: id }, audit));
                continue;
            }

            let mut upstream = upstream_request.clone();
            backend.descriptor().upstream_model(&request.model).clone_into(&mut upstream.model);

            match self.exchange(&backend, &upstream, &conversation).await {
                Ok(exchange) => {
                    self.registry.health().record_success(&id);
                    audit.answered_by(&backend, &conversation, Some(exchange.native_request));
                    audit.record.native_response = Some(exchange.native_response);
                    if !attempts.is_empty() {
                        tracing::info!(backend = %id, failed = attempts.len(), "request answered after fallback");
                    }
                    return Ok(exchange.response);
                }
                Err(e) => {
                    self.observe_failure(&id, &e);
                    if candidates.pinned || !e.is_retryable() {
                        return Err(e);
                    }
                    tracing::warn!(backend = %id, error = %e, "backend failed, trying next candidate");
                    attempts.push(attempt(&e, audit));
                }
            }
        }

        Err(LlmError::AllBackendsUnavailable { attempts })
    }

    /// One attempt against one backend, including the session turn for a
    /// stateful backend
    async fn exchange(
        &self,
        backend: &Arc<dyn Backend>,
        request: &CompletionRequest,
        conversation: &Conversation,
    ) -> Result<Exchange, LlmError> {
        let timeout = backend.descriptor().timeout;

        if !backend.is_stateful() {
            return within(backend.id(), timeout, backend.complete(request, None)).await;
        }

        let turn = self.sessions.begin(backend.id(), conversation.key()?).await?;
        let session = self.sessions.context(&turn, conversation.restart).await?;
        let exchange = within(backend.id(), timeout, backend.complete(request, Some(&session))).await?;

        if let Some(ref continuation) = exchange.continuation {
            self.sessions.commit(&turn, continuation).await?;
        }

        Ok(exchange)
    }

    /// Start a streaming answer
    ///
    /// Falls back until a candidate produces its first event; from then on
    /// the stream is bound to that backend and a failure ends it with one
    /// error item.
    pub async fn complete_stream(
        &self,
        mut request: CompletionRequest,
        context: &RequestContext,
    ) -> Result<RoutedStream, LlmError> {
        merge_context(&mut request, context);
        request.stream = true;
        let mut audit = AuditDraft::new(self.audit.clone(), context, &request);

        match self.start_stream(&request, &mut audit).await {
            Ok(opened) => {
                let backend = opened.backend;
                let relay = Relay {
                    events: stream::iter([Ok(opened.first)]).chain(opened.events).boxed(),
                    timeout: opened.timeout,
                    turn: opened.turn,
                    sessions: Arc::clone(&self.sessions),
                    registry: Arc::clone(&self.registry),
                    backend: backend.clone(),
                    audit,
                    text: String::new(),
                    finish: None,
                    usage: None,
                    finished: false,
                };

                Ok(RoutedStream {
                    backend,
                    model: request.model,
                    events: relay.into_stream(),
                })
            }
            Err(e) => {
                audit.fail(&e);
                audit.submit();
                Err(e)
            }
        }
    }

    async fn start_stream(
        &self,
        request: &CompletionRequest,
        audit: &mut AuditDraft,
    ) -> Result<OpenedStream, LlmError> {
        let (upstream_request, candidates, conversation) = self.plan(request)?;
        let mut attempts = Vec::new();

        for backend in candidates.backends {
            let id = backend.id().to_owned();
            if !candidates.pinned && !self.registry.health().is_available(&id) {
                attempts.push(attempt(&LlmError::CircuitOpen { backend: id }, audit));
                continue;
            }

            let mut upstream = upstream_request.clone();
            backend.descriptor().upstream_model(&request.model).clone_into(&mut upstream.model);

            match self.open_stream(&backend, &upstream, &conversation).await {
                Ok((start, first, turn)) => {
                    self.registry.health().record_success(&id);
                    audit.answered_by(&backend, &conversation, Some(start.native_request));
                    return Ok(OpenedStream {
                        backend: id,
                        timeout: backend.descriptor().timeout,
                        first,
                        events: start.events,
                        turn,
                    });
                }
                Err(e) => {
                    self.observe_failure(&id, &e);
                    if candidates.pinned || !e.is_retryable() {
                        return Err(e);
                    }
                    tracing::warn!(backend = %id, error = %e, "stream failed before first event, trying next candidate");
                    attempts.push(attempt(&e, audit));
                }
            }
        }

        Err(LlmError::AllBackendsUnavailable { attempts })
    }

    /// Open a stream and wait for its first event within the backend timeout
    async fn open_stream(
        &self,
        backend: &Arc<dyn Backend>,
        request: &CompletionRequest,
        conversation: &Conversation,
    ) -> Result<(StreamStart, StreamEvent, Option<TurnGuard>), LlmError> {
        let (session, turn) = if backend.is_stateful() {
            let turn = self.sessions.begin(backend.id(), conversation.key()?).await?;
            let session = self.sessions.context(&turn, conversation.restart).await?;
            (Some(session), Some(turn))
        } else {
            (None, None)
        };

        let opened = first_event(backend.as_ref(), request, session.as_ref());
        let (start, first) = within(backend.id(), backend.descriptor().timeout, opened).await?;
        Ok((start, first, turn))
    }

    /// Validate a request and resolve its candidates and conversation
    ///
    /// A conversation key that stateful candidates would need is checked
    /// here, before any backend is called.
    fn plan(&self, request: &CompletionRequest) -> Result<(CompletionRequest, Candidates, Conversation), LlmError> {
        request.validate()?;
        let (upstream_request, candidates) = self.candidates(request)?;
        let conversation = Conversation::of(&upstream_request);
        if candidates.backends.iter().any(|b| b.is_stateful()) {
            conversation.key()?;
        }
        Ok((upstream_request, candidates, conversation))
    }

    /// Record an attempt failure against backend health
    ///
    /// Only failures that say something about the backend count.
    fn observe_failure(&self, backend: &str, error: &LlmError) {
        if error.is_retryable() {
            self.registry.health().record_failure(backend, &error.to_string());
        }
    }

    /// Resolve candidates in precedence order
    ///
    /// Returns the request to send upstream, with a `backend/` model prefix
    /// stripped when it pinned the backend.
    fn candidates(&self, request: &CompletionRequest) -> Result<(CompletionRequest, Candidates), LlmError> {
        let mut upstream = request.clone();

        if let Some(ref id) = request.backend {
            let backend = self.registry.resolve(id)?;
            return Ok((
                upstream,
                Candidates {
                    backends: vec![backend],
                    pinned: true,
                },
            ));
        }

        if let Some((prefix, model)) = request.model.split_once('/')
            && let Ok(backend) = self.registry.resolve(prefix)
        {
            model.clone_into(&mut upstream.model);
            return Ok((
                upstream,
                Candidates {
                    backends: vec![backend],
                    pinned: true,
                },
            ));
        }

        let mut backends = self.registry.by_model(&request.model);
        if backends.is_empty()
            && let Some(ref id) = self.default_backend
            && let Ok(backend) = self.registry.resolve(id)
        {
            backends.push(backend);
        }

        if backends.is_empty() {
            return Err(LlmError::ModelNotFound {
                model: request.model.clone(),
            });
        }

        let mut seen = HashSet::new();
        backends.retain(|b| seen.insert(b.id().to_owned()));

        Ok((
            upstream,
            Candidates {
                backends,
                pinned: false,
            },
        ))
    }

    /// Delete the session records of an explicit session id
    pub async fn delete_session(&self, session_id: &str) -> Result<usize, LlmError> {
        let deleted = self.sessions.end_explicit(session_id).await?;
        tracing::info!(session_id, deleted, "session deleted by caller");
        Ok(deleted)
    }

    pub fn models(&self) -> Vec<ModelEntry> {
        self.registry.models()
    }

    pub async fn reload(&self) -> Result<Vec<String>, LlmError> {
        self.registry.reload().await
    }
}

/// Body fields win over routing headers
fn merge_context(request: &mut CompletionRequest, context: &RequestContext) {
    if request.backend.is_none() {
        request.backend.clone_from(&context.backend);
    }
    if request.session_id.is_none() {
        request.session_id.clone_from(&context.session_id);
    }
}

async fn first_event(
    backend: &dyn Backend,
    request: &CompletionRequest,
    session: Option<&SessionContext>,
) -> Result<(StreamStart, StreamEvent), LlmError> {
    let mut start = backend.complete_stream(request, session).await?;
    match start.events.next().await {
        Some(Ok(first)) => Ok((start, first)),
        Some(Err(e)) => Err(e),
        None => Err(LlmError::BadUpstreamResponse {
            backend: backend.id().to_owned(),
            message: "stream ended before any event".to_owned(),
            raw: String::new(),
        }),
    }
}

async fn within<T>(
    backend: &str,
    timeout: Duration,
    attempt: impl Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| LlmError::UpstreamTimeout {
            backend: backend.to_owned(),
        })?
}

fn attempt(error: &LlmError, audit: &mut AuditDraft) -> Attempt {
    let backend = match error {
        LlmError::CircuitOpen { backend }
        | LlmError::UpstreamTimeout { backend }
        | LlmError::UpstreamUnavailable { backend, .. }
        | LlmError::BadUpstreamResponse { backend, .. }
        | LlmError::UpstreamRejected { backend, .. } => backend.clone(),
        _ => String::new(),
    };

    let attempt = Attempt {
        backend,
        error: error.to_string(),
    };
    audit.record.attempts.push(AttemptRecord {
        backend: attempt.backend.clone(),
        error: attempt.error.clone(),
    });
    attempt
}

/// Exchange record under construction
///
/// Submitted exactly once: explicitly, or on drop when a stream is
/// abandoned by the caller.
struct AuditDraft {
    sink: AuditSink,
    record: ExchangeRecord,
    started: Instant,
    submitted: bool,
}

impl AuditDraft {
    fn new(sink: AuditSink, context: &RequestContext, request: &CompletionRequest) -> Self {
        Self {
            sink,
            record: ExchangeRecord {
                id: Uuid::new_v4(),
                request_id: context.request_id.clone(),
                started_at: Timestamp::now(),
                duration_ms: 0,
                backend: None,
                conversation_key: None,
                stream: request.stream,
                public_request: serde_json::to_value(request).unwrap_or_default(),
                native_request: None,
                native_response: None,
                public_response: None,
                usage: None,
                attempts: Vec::new(),
                error: None,
            },
            started: Instant::now(),
            submitted: false,
        }
    }

    fn answered_by(&mut self, backend: &Arc<dyn Backend>, conversation: &Conversation, native: Option<serde_json::Value>) {
        self.record.backend = Some(backend.id().to_owned());
        if backend.is_stateful() {
            self.record.conversation_key.clone_from(&conversation.key);
        }
        self.record.native_request = native;
    }

    fn succeed(&mut self, public_response: Option<serde_json::Value>, usage: Option<Usage>) {
        self.record.public_response = public_response;
        self.record.usage = usage.map(|u| ExchangeUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
    }

    fn fail(&mut self, error: &LlmError) {
        self.record.error = Some(error.to_string());
        if let Some(raw) = error.raw_payload() {
            self.record.native_response = Some(serde_json::Value::String(raw.to_owned()));
        }
    }

    fn submit(&mut self) {
        if std::mem::replace(&mut self.submitted, true) {
            return;
        }
        self.record.duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.sink.submit(self.record.clone());
    }
}

impl Drop for AuditDraft {
    fn drop(&mut self) {
        if !self.submitted {
            if self.record.error.is_none() && self.record.public_response.is_none() {
                self.record.error = Some("stream abandoned by caller".to_owned());
            }
            self.submit();
        }
    }
}

/// Relays a committed stream to the caller
///
/// Consumes continuation events into the session manager, ends the stream
/// after the first error and guarantees a trailing `Done` on success. Each
/// upstream event must arrive within the backend timeout, otherwise the
/// stream ends with `UpstreamTimeout`. The turn guard lives as long as the
/// relay, so a caller disconnect or a stall releases the conversation.
struct Relay {
    events: EventStream,
    timeout: Duration,
    turn: Option<TurnGuard>,
    sessions: Arc<SessionManager>,
    registry: Arc<Registry>,
    backend: String,
    audit: AuditDraft,
    text: String,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,
}

impl Relay {
    fn into_stream(self) -> EventStream {
        stream::unfold(self, |mut relay| async move { relay.next().await.map(|item| (item, relay)) }).boxed()
    }

    async fn next(&mut self) -> Option<Result<StreamEvent, LlmError>> {
        if self.finished {
            return None;
        }

        loop {
            let Ok(next) = tokio::time::timeout(self.timeout, self.events.next()).await else {
                let stalled = LlmError::UpstreamTimeout {
                    backend: self.backend.clone(),
                };
                self.registry.health().record_failure(&self.backend, &stalled.to_string());
                return Some(Err(self.fail(stalled)));
            };

            match next {
                Some(Ok(StreamEvent::Continuation(continuation))) => {
                    let committed = match self.turn {
                        Some(ref turn) => self.sessions.commit(turn, &continuation).await.map(|_| ()),
                        None => Ok(()),
                    };
                    if let Err(e) = committed {
                        return Some(Err(self.fail(e)));
                    }
                }
                Some(Ok(StreamEvent::Done)) => return Some(Ok(self.complete())),
                Some(Ok(event)) => {
                    self.observe(&event);
                    return Some(Ok(event));
                }
                Some(Err(e)) => {
                    self.registry.health().record_failure(&self.backend, &e.to_string());
                    return Some(Err(self.fail(e)));
                }
                None if self.finish.is_some() => return Some(Ok(self.complete())),
                None => {
                    return Some(Err(self.fail(LlmError::UpstreamUnavailable {
                        backend: self.backend.clone(),
                        message: "stream closed before completion".to_owned(),
                    })));
                }
            }
        }
    }

    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Delta(delta) => {
                if let Some(ref content) = delta.content {
                    self.text.push_str(content);
                }
                if delta.finish_reason.is_some() {
                    self.finish = delta.finish_reason;
                }
            }
            StreamEvent::Usage(usage) => self.usage = Some(*usage),
            StreamEvent::Continuation(_) | StreamEvent::Done => {}
        }
    }

    fn complete(&mut self) -> StreamEvent {
        self.finished = true;
        self.turn = None;

        let response = serde_json::json!({
            "content": self.text,
            "finish_reason": self.finish.map(FinishReason::as_str),
        });
        self.audit.succeed(Some(response), self.usage);
        self.audit.submit();

        StreamEvent::Done
    }

    fn fail(&mut self, error: LlmError) -> LlmError {
        self.finished = true;
        self.turn = None;
        tracing::warn!(backend = %self.backend, error = %error, "stream failed after first event");
        self.audit.fail(&error);
        self.audit.submit();
        error
    }
}
