//! Anthropic Messages API backend client

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use url::Url;

use super::{Backend, BackendDescriptor, EventStream, Exchange, StreamStart};
use crate::convert::anthropic::{AnthropicStreamState, from_native, to_native};
use crate::error::LlmError;
use crate::protocol::anthropic::{AnthropicResponse, AnthropicStreamEvent};
use crate::session::SessionContext;
use crate::types::CompletionRequest;

/// Default Anthropic API base URL
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Stateless backend speaking the Anthropic Messages API
pub struct AnthropicBackend {
    descriptor: BackendDescriptor,
    client: Client,
    base_url: Url,
}

impl AnthropicBackend {
    /// Create from a backend descriptor
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Internal` if the HTTP client cannot be built.
    pub fn new(descriptor: BackendDescriptor) -> Result<Self, LlmError> {
        Ok(Self {
            client: super::http_client(&descriptor)?,
            base_url: super::base_url(&descriptor, DEFAULT_BASE_URL)?,
            descriptor,
        })
    }

    /// Add the version header and the API key, when one is configured
    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.descriptor.api_key {
            Some(key) => builder.header("x-api-key", key.expose_secret()),
            None => builder,
        }
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.authorize(
            self.client
                .post(super::endpoint(&self.base_url, "v1/messages"))
                .json(body),
        )
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _session: Option<&SessionContext>,
    ) -> Result<Exchange, LlmError> {
        let native_request = serde_json::to_value(to_native(request)).map_err(|e| LlmError::Internal(e.into()))?;

        let response = super::send(self.id(), self.post(&native_request)).await?;
        let (wire, native_response) = super::read_json::<AnthropicResponse>(self.id(), response).await?;

        Ok(Exchange {
            response: from_native(wire),
            native_request,
            native_response,
            continuation: None,
        })
    }

    /// Stream a completion, reframing Anthropic events as canonical deltas
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        _session: Option<&SessionContext>,
    ) -> Result<StreamStart, LlmError> {
        let native_request = serde_json::to_value(to_native(request)).map_err(|e| LlmError::Internal(e.into()))?;

        let response = super::send(self.id(), self.post(&native_request)).await?;
        let backend = self.id().to_owned();
        let mut state = AnthropicStreamState::new();

        let events: EventStream = Box::pin(
            super::sse_data(self.id(), response)
                .map(move |item| {
                    let data = match item {
                        Ok(data) => data,
                        Err(e) => return vec![Err(e)],
                    };
                    match serde_json::from_str::<AnthropicStreamEvent>(&data) {
                        Ok(event) => match state.convert_event(&backend, event) {
                            Ok(events) => events.into_iter().map(Ok).collect(),
                            Err(e) => vec![Err(e)],
                        },
                        Err(e) => vec![Err(LlmError::BadUpstreamResponse {
                            backend: backend.clone(),
                            message: format!("unreadable stream event: {e}"),
                            raw: data,
                        })],
                    }
                })
                .flat_map(futures_util::stream::iter),
        );

        Ok(StreamStart { native_request, events })
    }

    /// Liveness check against the model list endpoint
    async fn probe(&self) -> Result<(), LlmError> {
        let builder = self.authorize(self.client.get(super::endpoint(&self.base_url, "v1/models")));
        super::send(self.id(), builder).await.map(drop)
    }
}
