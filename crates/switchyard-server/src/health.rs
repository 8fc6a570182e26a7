use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use http::StatusCode;
use serde::Serialize;
use switchyard_llm::RequestRouter;
use switchyard_llm::registry::BackendStatus;

/// Liveness handler
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
pub struct BackendsReport {
    generation: u64,
    loaded_at: jiff::Timestamp,
    backends: Vec<BackendStatus>,
    audit: AuditReport,
    active_turns: usize,
}

#[derive(Debug, Serialize)]
struct AuditReport {
    enabled: bool,
    dropped: u64,
}

/// Registry snapshot with per-backend health and the audit drop counter
pub async fn backends_handler(State(router): State<Arc<RequestRouter>>) -> Json<BackendsReport> {
    let snapshot = router.registry().snapshot();

    Json(BackendsReport {
        generation: snapshot.generation(),
        loaded_at: snapshot.loaded_at(),
        backends: router.registry().health_report(),
        audit: AuditReport {
            enabled: router.audit().is_enabled(),
            dropped: router.audit().dropped(),
        },
        active_turns: router.sessions().active_turns(),
    })
}
