use http::HeaderMap;

/// Header pinning a request to one backend by id
pub const BACKEND_HEADER: &str = "x-switchyard-backend";

/// Header carrying an explicit conversation/session identifier
pub const SESSION_HEADER: &str = "x-switchyard-session";

/// Header echoing the gateway-assigned request identifier
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Runtime context for a single inbound request
///
/// Built once by the server middleware and handed to the router alongside
/// the decoded request body
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Gateway-assigned identifier, also used for the audit record
    pub request_id: String,
    /// Backend pinned through the routing header
    pub backend: Option<String>,
    /// Explicit session identifier from the session header
    pub session_id: Option<String>,
}

impl RequestContext {
    /// Build a context from inbound headers
    ///
    /// Empty or non-UTF-8 routing headers are ignored
    pub fn from_headers(headers: &HeaderMap, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            backend: header_value(headers, BACKEND_HEADER),
            session_id: header_value(headers, SESSION_HEADER),
        }
    }

    /// Create a minimal context for embedded (non-HTTP) use
    pub fn empty() -> Self {
        Self::default()
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}
