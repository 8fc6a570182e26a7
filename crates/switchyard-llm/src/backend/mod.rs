//! Backend clients, one per wire protocol
//!
//! A client speaks exactly one upstream protocol and normalizes its answers
//! into canonical types. Retry, fallback and session bookkeeping belong to
//! the router; clients only classify failures.

pub mod anthropic;
pub mod openai;
pub mod threaded;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use switchyard_config::{BackendConfig, BackendKind};
use url::Url;

use crate::error::LlmError;
use crate::session::SessionContext;
use crate::types::{CompletionRequest, CompletionResponse, Continuation, StreamEvent};

/// Stream of canonical events produced by one backend call
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Error bodies are truncated to this many bytes in error messages
const MAX_ERROR_BODY: usize = 512;

/// Immutable description of one configured backend
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub kind: BackendKind,
    pub enabled: bool,
    /// Higher wins ties between backends serving one model
    pub priority: i32,
    pub base_url: Option<Url>,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub models: Vec<String>,
    pub default_model: Option<String>,
    pub tool_priming: bool,
}

impl BackendDescriptor {
    pub fn from_config(id: impl Into<String>, config: &BackendConfig) -> Self {
        Self {
            id: id.into(),
            kind: config.kind,
            enabled: config.enabled,
            priority: config.priority,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
            models: config.models.clone(),
            default_model: config.effective_default_model().map(ToOwned::to_owned),
            tool_priming: config.tool_priming,
        }
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Model name to send upstream for a requested model
    ///
    /// The requested model if advertised, else the default model. A backend
    /// advertising nothing passes the requested name through.
    pub fn upstream_model<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.serves(requested) {
            return requested;
        }
        self.default_model.as_deref().unwrap_or(requested)
    }
}

/// Result of a successful non-streaming call
#[derive(Debug, Clone)]
pub struct Exchange {
    pub response: CompletionResponse,
    pub native_request: serde_json::Value,
    pub native_response: serde_json::Value,
    /// Set by stateful backends only
    pub continuation: Option<Continuation>,
}

/// An established upstream stream
pub struct StreamStart {
    pub native_request: serde_json::Value,
    /// Stateful backends emit a `Continuation` event ahead of the finish delta
    pub events: EventStream,
}

impl std::fmt::Debug for StreamStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStart")
            .field("native_request", &self.native_request)
            .finish_non_exhaustive()
    }
}

/// Client for one upstream backend
#[async_trait]
pub trait Backend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    fn is_stateful(&self) -> bool {
        self.descriptor().kind.is_stateful()
    }

    /// Send a non-streaming completion
    ///
    /// `session` is provided for stateful backends only.
    async fn complete(
        &self,
        request: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<Exchange, LlmError>;

    /// Open a streaming completion
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<StreamStart, LlmError>;

    /// Cheap reachability check
    async fn probe(&self) -> Result<(), LlmError>;
}

/// Build the client matching a descriptor's kind
pub fn build(descriptor: BackendDescriptor) -> Result<Arc<dyn Backend>, LlmError> {
    let backend: Arc<dyn Backend> = match descriptor.kind {
        BackendKind::Openai => Arc::new(openai::OpenAiBackend::new(descriptor)?),
        BackendKind::Anthropic => Arc::new(anthropic::AnthropicBackend::new(descriptor)?),
        BackendKind::Threaded => Arc::new(threaded::ThreadedBackend::new(descriptor)?),
    };
    Ok(backend)
}

/// HTTP client shared by one backend's calls
///
/// Only connecting is bounded here. The router bounds the wait for each
/// response and for every streamed event, since a total timeout would cut
/// off long streams.
fn http_client(descriptor: &BackendDescriptor) -> Result<Client, LlmError> {
    Client::builder()
        .connect_timeout(descriptor.timeout)
        .build()
        .map_err(|e| LlmError::Internal(anyhow::anyhow!("failed to build HTTP client for {}: {e}", descriptor.id)))
}

fn base_url(descriptor: &BackendDescriptor, default: &str) -> Result<Url, LlmError> {
    match &descriptor.base_url {
        Some(url) => Ok(url.clone()),
        None => Url::parse(default).map_err(|e| LlmError::Internal(e.into())),
    }
}

fn endpoint(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Send a request, mapping transport failures and non-2xx statuses
async fn send(backend: &str, builder: RequestBuilder) -> Result<Response, LlmError> {
    let response = builder.send().await.map_err(|e| {
        tracing::warn!(backend, error = %e, "upstream request failed");
        transport_error(backend, &e)
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(backend, status = %status, "upstream returned error");
    Err(status_error(backend, status, &body))
}

fn transport_error(backend: &str, error: &reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::UpstreamTimeout {
            backend: backend.to_owned(),
        }
    } else {
        LlmError::UpstreamUnavailable {
            backend: backend.to_owned(),
            message: error.to_string(),
        }
    }
}

/// Classify a non-2xx upstream status
///
/// Throttling, credential failures and server errors are the backend's
/// problem and retryable; any other 4xx means the request itself is bad.
pub(crate) fn status_error(backend: &str, status: StatusCode, body: &str) -> LlmError {
    let message = format!("{status}: {}", error_message(body));
    let retryable = status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
        )
        || !status.is_client_error();

    if retryable {
        LlmError::UpstreamUnavailable {
            backend: backend.to_owned(),
            message,
        }
    } else {
        LlmError::UpstreamRejected {
            backend: backend.to_owned(),
            status: status.as_u16(),
            message,
        }
    }
}

/// Pull `error.message` out of a JSON error body, else a truncated body
fn error_message(body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
    });

    from_json.unwrap_or_else(|| {
        let mut end = body.len().min(MAX_ERROR_BODY);
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_owned()
    })
}

/// Read a JSON body, keeping the raw value for the audit record
async fn read_json<T: DeserializeOwned>(backend: &str, response: Response) -> Result<(T, serde_json::Value), LlmError> {
    let raw = response.text().await.map_err(|e| transport_error(backend, &e))?;
    parse_json(backend, &raw)
}

pub(crate) fn parse_json<T: DeserializeOwned>(backend: &str, raw: &str) -> Result<(T, serde_json::Value), LlmError> {
    let bad = |e: serde_json::Error| LlmError::BadUpstreamResponse {
        backend: backend.to_owned(),
        message: e.to_string(),
        raw: raw.to_owned(),
    };

    let value: serde_json::Value = serde_json::from_str(raw).map_err(bad)?;
    let parsed = T::deserialize(&value).map_err(bad)?;
    Ok((parsed, value))
}

/// SSE `data:` payloads of a streaming response, trimmed and non-empty
fn sse_data(backend: &str, response: Response) -> impl Stream<Item = Result<String, LlmError>> + Send + use<> {
    let backend = backend.to_owned();
    response.bytes_stream().eventsource().filter_map(move |result| {
        let item = match result {
            Ok(event) => {
                let data = event.data.trim();
                (!data.is_empty()).then(|| Ok(data.to_owned()))
            }
            Err(e) => Some(Err(LlmError::UpstreamUnavailable {
                backend: backend.clone(),
                message: format!("stream interrupted: {e}"),
            })),
        };
        std::future::ready(item)
    })
}
