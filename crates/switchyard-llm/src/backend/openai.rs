//! OpenAI-compatible backend client

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use url::Url;

use super::{Backend, BackendDescriptor, EventStream, Exchange, StreamStart};
use crate::convert::openai::{chunk_to_events, to_native};
use crate::error::LlmError;
use crate::protocol::openai::{OpenAiErrorResponse, OpenAiResponse, OpenAiStreamChunk};
use crate::session::SessionContext;
use crate::types::{CompletionRequest, StreamEvent};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Whether the backend is the canonical `OpenAI` API rather than a compatible one
fn is_canonical_openai(base_url: &Url) -> bool {
    base_url.host_str().is_some_and(|h| h == "api.openai.com")
}

pub struct OpenAiBackend {
    descriptor: BackendDescriptor,
    client: Client,
    base_url: Url,
}

impl OpenAiBackend {
    pub fn new(descriptor: BackendDescriptor) -> Result<Self, LlmError> {
        Ok(Self {
            client: super::http_client(&descriptor)?,
            base_url: super::base_url(&descriptor, DEFAULT_BASE_URL)?,
            descriptor,
        })
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(super::endpoint(&self.base_url, "chat/completions"))
            .json(body);
        self.authorize(builder)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.descriptor.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }
}

/// Map one SSE payload to canonical events
///
/// Compatible servers report failures after the headers as an in-band
/// `{"error": ...}` payload.
fn data_to_events(backend: &str, data: &str) -> Vec<Result<StreamEvent, LlmError>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done)];
    }

    if let Ok(error) = serde_json::from_str::<OpenAiErrorResponse>(data) {
        return vec![Err(LlmError::UpstreamUnavailable {
            backend: backend.to_owned(),
            message: error.error.message,
        })];
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => chunk_to_events(&chunk).into_iter().map(Ok).collect(),
        Err(e) => vec![Err(LlmError::BadUpstreamResponse {
            backend: backend.to_owned(),
            message: format!("unreadable stream chunk: {e}"),
            raw: data.to_owned(),
        })],
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _session: Option<&SessionContext>,
    ) -> Result<Exchange, LlmError> {
        let native = to_native(request, false);
        let native_request = serde_json::to_value(&native).map_err(|e| LlmError::Internal(e.into()))?;

        let response = super::send(self.id(), self.post(&native_request)).await?;
        let (wire, native_response) = super::read_json::<OpenAiResponse>(self.id(), response).await?;

        Ok(Exchange {
            response: wire.into(),
            native_request,
            native_response,
            continuation: None,
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        _session: Option<&SessionContext>,
    ) -> Result<StreamStart, LlmError> {
        // Many compatible servers reject the unknown `stream_options` field
        let native = to_native(request, is_canonical_openai(&self.base_url));
        let native_request = serde_json::to_value(&native).map_err(|e| LlmError::Internal(e.into()))?;

        let response = super::send(self.id(), self.post(&native_request)).await?;
        let backend = self.id().to_owned();
        let events: EventStream = Box::pin(
            super::sse_data(self.id(), response)
                .map(move |item| match item {
                    Ok(data) => data_to_events(&backend, &data),
                    Err(e) => vec![Err(e)],
                })
                .flat_map(futures_util::stream::iter),
        );

        Ok(StreamStart { native_request, events })
    }

    async fn probe(&self) -> Result<(), LlmError> {
        let builder = self.authorize(self.client.get(super::endpoint(&self.base_url, "models")));
        super::send(self.id(), builder).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::TryStreamExt;
    use serde_json::json;
    use switchyard_config::BackendKind;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::types::{CompletionParams, FinishReason, Message, Role};

    fn backend(server: &MockServer) -> OpenAiBackend {
        OpenAiBackend::new(BackendDescriptor {
            id: "primary".to_owned(),
            kind: BackendKind::Openai,
            enabled: true,
            priority: 10,
            base_url: Some(Url::parse(&format!("{}/v1", server.uri())).unwrap()),
            api_key: Some("sk-test".into()),
            timeout: Duration::from_secs(5),
            models: vec!["m".to_owned()],
            default_model: Some("m".to_owned()),
            tool_priming: false,
        })
        .unwrap()
    }

    fn request(stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: "m".to_owned(),
            messages: vec![Message::text(Role::System, "be brief"), Message::text(Role::User, "hello")],
            params: CompletionParams::default(),
            tools: None,
            tool_choice: None,
            stream,
            backend: None,
            session_id: None,
        }
    }

    fn sse(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body.to_owned())
    }

    #[tokio::test]
    async fn sends_full_history_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"messages": [{"role": "system"}, {"role": "user", "content": "hello"}]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "m",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchange = backend(&server).complete(&request(false), None).await.unwrap();
        assert_eq!(exchange.response.choices[0].message.role, "assistant");
        assert_eq!(exchange.native_request["messages"].as_array().unwrap().len(), 2);
        assert_eq!(exchange.native_response["id"], "chatcmpl-1");
        assert!(exchange.continuation.is_none());
    }

    #[tokio::test]
    async fn server_error_is_retryable_and_bad_request_is_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": {"message": "bad field"}})))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let first = backend.complete(&request(false), None).await.unwrap_err();
        assert!(matches!(first, LlmError::UpstreamUnavailable { .. }));

        let second = backend.complete(&request(false), None).await.unwrap_err();
        assert!(matches!(second, LlmError::UpstreamRejected { status: 400, ref message, .. } if message.contains("bad field")));
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_upstream_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = backend(&server).complete(&request(false), None).await.unwrap_err();
        assert_eq!(err.raw_payload(), Some("not json"));
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(concat!(
                "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
                "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            )))
            .mount(&server)
            .await;

        let start = backend(&server).complete_stream(&request(true), None).await.unwrap();
        assert!(start.native_request.get("stream_options").is_none());

        let events: Vec<StreamEvent> = start.events.try_collect().await.unwrap();
        assert_eq!(events.len(), 3);
        let StreamEvent::Delta(last) = &events[1] else { panic!("expected delta") };
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[tokio::test]
    async fn in_band_error_ends_the_stream_with_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse(concat!(
                "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"error\":{\"message\":\"model crashed\",\"type\":\"server_error\"}}\n\n",
            )))
            .mount(&server)
            .await;

        let mut events = backend(&server).complete_stream(&request(true), None).await.unwrap().events;
        assert!(matches!(events.next().await, Some(Ok(StreamEvent::Delta(_)))));
        let err = events.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("model crashed"));
    }

    #[tokio::test]
    async fn probe_hits_models_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": []})))
            .expect(1)
            .mount(&server)
            .await;

        backend(&server).probe().await.unwrap();
    }
}
