//! Administrative trigger routes
//!
//! Mounted only when `[admin]` is configured. Every request must carry
//! `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use switchyard_llm::RequestRouter;
use switchyard_llm::handler::error_response;

/// Reject admin requests without the configured bearer token
pub async fn admin_auth_middleware(token: SecretString, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented != Some(token.expose_secret()) {
        tracing::warn!(path = %request.uri().path(), "admin request rejected");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    next.run(request).await
}

/// `POST /internal/reload`
pub async fn reload_handler(State(router): State<Arc<RequestRouter>>) -> Response {
    match router.reload().await {
        Ok(backends) => Json(serde_json::json!({
            "generation": router.registry().snapshot().generation(),
            "backends": backends,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /internal/backends/{id}/probe`
pub async fn probe_handler(State(router): State<Arc<RequestRouter>>, Path(id): Path<String>) -> Response {
    match router.registry().probe(&id).await {
        Ok(health) => Json(health).into_response(),
        Err(e) => error_response(&e),
    }
}
