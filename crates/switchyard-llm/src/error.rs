use http::StatusCode;
use serde::Serialize;
use switchyard_core::HttpError;
use switchyard_store::StoreError;
use thiserror::Error;

/// One failed candidate inside a routed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub backend: String,
    pub error: String,
}

/// Errors that can occur while routing a completion
#[derive(Debug, Error)]
pub enum LlmError {
    /// Malformed or incomplete public request, rejected before any network call
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Explicitly requested backend is unknown or disabled
    #[error("backend not found: {backend}")]
    BackendNotFound { backend: String },

    /// No backend serves the model and no default backend is configured
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// Another turn for the same conversation is still in flight
    #[error("conversation {conversation_key} is busy with another turn")]
    ConversationBusy { conversation_key: String },

    /// Backend answered with something that could not be parsed
    #[error("backend {backend} returned an unreadable response: {message}")]
    BadUpstreamResponse {
        backend: String,
        message: String,
        /// Raw payload kept for the audit record
        raw: String,
    },

    /// Attempt exceeded the backend's timeout
    #[error("backend {backend} timed out")]
    UpstreamTimeout { backend: String },

    /// Network failure, 5xx, throttling or credential failure
    #[error("backend {backend} unavailable: {message}")]
    UpstreamUnavailable { backend: String, message: String },

    /// Backend refused the request shape (4xx)
    #[error("backend {backend} rejected the request ({status}): {message}")]
    UpstreamRejected {
        backend: String,
        status: u16,
        message: String,
    },

    /// Backend skipped because its circuit breaker is open
    #[error("backend {backend} skipped: circuit open")]
    CircuitOpen { backend: String },

    /// Every candidate failed
    #[error("all backends unavailable: {}", summarize(attempts))]
    AllBackendsUnavailable { attempts: Vec<Attempt> },

    /// Stream could not be relayed to the caller
    #[error("streaming error: {0}")]
    Streaming(String),

    /// Session records could not be read or written
    #[error("session store error: {0}")]
    SessionStore(#[from] StoreError),

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn summarize(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.backend, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl LlmError {
    /// Whether the router may try the next candidate after this error
    ///
    /// Errors caused by the input itself abort the fallback loop.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout { .. }
                | Self::UpstreamUnavailable { .. }
                | Self::BadUpstreamResponse { .. }
                | Self::CircuitOpen { .. }
        )
    }

    /// Stable machine-readable code used in error bodies
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::BackendNotFound { .. } => "backend_not_found",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::ConversationBusy { .. } => "conversation_busy",
            Self::BadUpstreamResponse { .. } => "bad_upstream_response",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::AllBackendsUnavailable { .. } => "all_backends_unavailable",
            Self::Streaming(_) => "streaming_error",
            Self::SessionStore(_) => "session_store_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Raw upstream payload, if the error carries one
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            Self::BadUpstreamResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

impl HttpError for LlmError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::BackendNotFound { .. } | Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ConversationBusy { .. } => StatusCode::CONFLICT,
            Self::BadUpstreamResponse { .. } | Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamRejected { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::CircuitOpen { .. } | Self::AllBackendsUnavailable { .. } | Self::SessionStore(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Streaming(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::BackendNotFound { .. } | Self::ModelNotFound { .. } => "not_found_error",
            Self::ConversationBusy { .. } => "conflict_error",
            Self::BadUpstreamResponse { .. }
            | Self::UpstreamTimeout { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::UpstreamRejected { .. }
            | Self::CircuitOpen { .. }
            | Self::AllBackendsUnavailable { .. } => "upstream_error",
            Self::Streaming(_) => "streaming_error",
            Self::SessionStore(_) | Self::Internal(_) => "internal_error",
        }
    }

    fn error_code(&self) -> &str {
        self.code()
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "an internal error occurred".to_owned(),
            Self::SessionStore(_) => "session store unavailable".to_owned(),
            other => other.to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::AllBackendsUnavailable { attempts } => Some(serde_json::json!({ "attempts": attempts })),
            _ => None,
        }
    }
}
