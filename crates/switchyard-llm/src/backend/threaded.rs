//! Client for the stateful conversation backend
//!
//! A conversation is created on the backend the first time a chain is
//! started; every turn after that references the previous reply's message
//! id instead of resending history.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use url::Url;

use super::{Backend, BackendDescriptor, EventStream, Exchange, StreamStart};
use crate::convert::threaded::{ThreadedStreamState, from_native, to_native};
use crate::error::LlmError;
use crate::protocol::threaded::{CreateConversationRequest, CreateConversationResponse, ThreadedStreamEvent, TurnResponse};
use crate::session::SessionContext;
use crate::types::{CompletionRequest, StreamEvent};

pub struct ThreadedBackend {
    descriptor: BackendDescriptor,
    client: Client,
    base_url: Url,
}

impl ThreadedBackend {
    pub fn new(descriptor: BackendDescriptor) -> Result<Self, LlmError> {
        let base_url = descriptor
            .base_url
            .clone()
            .ok_or_else(|| LlmError::Internal(anyhow::anyhow!("backend {} requires a base_url", descriptor.id)))?;

        Ok(Self {
            client: super::http_client(&descriptor)?,
            base_url,
            descriptor,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.descriptor.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// Reuse the session's conversation, or create one for a new chain
    async fn conversation_id(&self, model: &str, session: Option<&SessionContext>) -> Result<String, LlmError> {
        if let Some(id) = session.and_then(|s| s.conversation_id.clone()) {
            return Ok(id);
        }

        let builder = self.authorize(
            self.client
                .post(super::endpoint(&self.base_url, "conversations"))
                .json(&CreateConversationRequest {
                    model: model.to_owned(),
                }),
        );
        let response = super::send(self.id(), builder).await?;
        let (created, _) = super::read_json::<CreateConversationResponse>(self.id(), response).await?;

        tracing::debug!(backend = %self.id(), conversation_id = %created.id, "created conversation");
        Ok(created.id)
    }

    /// Post one turn, returning the raw response and the audit form of the request
    async fn post_turn(
        &self,
        request: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<(reqwest::Response, String, serde_json::Value), LlmError> {
        let turn = to_native(request, session, self.descriptor.tool_priming)?;
        let conversation_id = self.conversation_id(&request.model, session).await?;

        let builder = self.authorize(
            self.client
                .post(super::endpoint(
                    &self.base_url,
                    &format!("conversations/{conversation_id}/messages"),
                ))
                .json(&turn),
        );
        let native_request = serde_json::json!({
            "conversation_id": conversation_id,
            "turn": turn,
        });

        let response = super::send(self.id(), builder).await?;
        Ok((response, conversation_id, native_request))
    }
}

#[async_trait]
impl Backend for ThreadedBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<Exchange, LlmError> {
        let (response, _, native_request) = self.post_turn(request, session).await?;
        let (wire, native_response) = super::read_json::<TurnResponse>(self.id(), response).await?;
        let (response, continuation) = from_native(wire, &request.model, request.has_tools());

        Ok(Exchange {
            response,
            native_request,
            native_response,
            continuation: Some(continuation),
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
        session: Option<&SessionContext>,
    ) -> Result<StreamStart, LlmError> {
        let (response, conversation_id, native_request) = self.post_turn(request, session).await?;
        let backend = self.id().to_owned();
        let mut state = ThreadedStreamState::new(self.id(), conversation_id, request.has_tools());

        let events: EventStream = Box::pin(
            super::sse_data(self.id(), response)
                .map(move |item| {
                    let data = match item {
                        Ok(data) => data,
                        Err(e) => return vec![Err(e)],
                    };
                    if data == "[DONE]" {
                        return vec![Ok(StreamEvent::Done)];
                    }
                    match serde_json::from_str::<ThreadedStreamEvent>(&data) {
                        Ok(event) => match state.convert_event(event) {
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

    async fn probe(&self) -> Result<(), LlmError> {
        let builder = self.authorize(self.client.get(super::endpoint(&self.base_url, "health")));
        super::send(self.id(), builder).await.map(drop)
    }
}
