//! Axum route handlers for the OpenAI-compatible surface

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json, Router, routing};
use futures_util::{Stream, StreamExt};
use switchyard_core::{HttpError, RequestContext};

use crate::convert;
use crate::error::LlmError;
use crate::protocol::openai::{OpenAiModel, OpenAiModelList, OpenAiRequest, OpenAiResponse};
use crate::router::{RequestRouter, RoutedStream};
use crate::types::response::now_unix;
use crate::types::{CompletionRequest, StreamEvent};

/// Build the public chat-completion routes
pub fn llm_router(router: Arc<RequestRouter>) -> Router {
    Router::new()
        .route("/v1/chat/completions", routing::post(chat_completions))
        .route("/v1/models", routing::get(list_models))
        .route("/v1/sessions/{session_id}", routing::delete(delete_session))
        .with_state(router)
}

/// Handle `POST /v1/chat/completions`
async fn chat_completions(
    State(router): State<Arc<RequestRouter>>,
    context: Option<Extension<RequestContext>>,
    payload: Result<Json<OpenAiRequest>, JsonRejection>,
) -> Response {
    let context = context.map(|Extension(c)| c).unwrap_or_default();

    let wire_request = match payload {
        Ok(Json(wire_request)) => wire_request,
        Err(rejection) => return error_response(&LlmError::InvalidRequest(rejection.body_text())),
    };

    let request: CompletionRequest = wire_request.into();

    if request.stream {
        match router.complete_stream(request, &context).await {
            Ok(routed) => stream_response(routed).into_response(),
            Err(e) => error_response(&e),
        }
    } else {
        match router.complete(request, &context).await {
            Ok(response) => Json(OpenAiResponse::from(&response)).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

/// Handle `GET /v1/models`
async fn list_models(State(router): State<Arc<RequestRouter>>) -> Json<OpenAiModelList> {
    let created = now_unix();
    let data = router
        .models()
        .into_iter()
        .map(|entry| OpenAiModel {
            id: entry.id,
            object: "model".to_owned(),
            created,
            owned_by: entry.owned_by,
        })
        .collect();

    Json(OpenAiModelList {
        object: "list".to_owned(),
        data,
    })
}

/// Handle `DELETE /v1/sessions/{session_id}`
async fn delete_session(State(router): State<Arc<RequestRouter>>, Path(session_id): Path<String>) -> Response {
    match router.delete_session(&session_id).await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Frame a routed stream as `OpenAI` SSE chunks
///
/// A failure becomes a final `{"error": ...}` event with no `[DONE]` after it.
fn stream_response(routed: RoutedStream) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let created = now_unix();
    let response_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let model = routed.model;
    let mut first = true;

    let events = routed.events.filter_map(move |result| {
        let event = match result {
            Ok(StreamEvent::Delta(delta)) => {
                let chunk = convert::openai::delta_to_chunk(&delta, &response_id, &model, created, first);
                first = false;
                Some(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()))
            }
            Ok(StreamEvent::Usage(usage)) => {
                let chunk = convert::openai::usage_to_chunk(usage, &response_id, &model, created);
                Some(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()))
            }
            Ok(StreamEvent::Continuation(_)) => None,
            Ok(StreamEvent::Done) => Some(Event::default().data("[DONE]")),
            Err(e) => Some(Event::default().data(e.error_body().to_string())),
        };
        std::future::ready(event.map(Ok))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Convert an error to an `OpenAI`-style JSON error response
pub fn error_response(error: &LlmError) -> Response {
    if error.status_code().is_server_error() {
        tracing::warn!(error = %error, "request failed");
    } else {
        tracing::debug!(error = %error, "request rejected");
    }

    (error.status_code(), Json(error.error_body())).into_response()
}
