use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use http::HeaderValue;
use switchyard_core::{REQUEST_ID_HEADER, RequestContext};

/// Middleware that builds the `RequestContext` for downstream handlers
///
/// Reuses an inbound `x-request-id` or assigns a new one, and echoes it on
/// the response.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToOwned::to_owned);

    let context = RequestContext::from_headers(request.headers(), request_id.clone());
    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
