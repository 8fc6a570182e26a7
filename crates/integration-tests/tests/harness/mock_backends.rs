//! Mock upstream servers for integration tests
//!
//! `MockOpenAi` speaks the OpenAI chat-completions wire format and can be
//! told to fail or to drop a stream halfway. `MockThreaded` speaks the
//! stateful conversation protocol and records every turn it receives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use futures_util::{StreamExt, stream};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Bind `app` on an ephemeral port and serve it until `shutdown`
async fn spawn(app: Router) -> anyhow::Result<(SocketAddr, CancellationToken)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .ok();
    });

    Ok((addr, shutdown))
}

fn sse_frame(data: &str) -> String {
    format!("data: {data}\n\n")
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

/// How the OpenAI mock behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer every request with this content
    Reply(String),
    /// Fail every request with this status
    Fail(u16),
    /// Stream one chunk, then drop the connection
    BreakMidStream,
}

/// Mock OpenAI-compatible backend
pub struct MockOpenAi {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<OpenAiState>,
}

struct OpenAiState {
    behavior: Behavior,
    completion_count: AtomicU32,
    requests: Mutex<Vec<Value>>,
}

impl MockOpenAi {
    pub async fn start(behavior: Behavior) -> anyhow::Result<Self> {
        let state = Arc::new(OpenAiState {
            behavior,
            completion_count: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(openai_completions))
            .route("/v1/models", routing::get(openai_models))
            .with_state(Arc::clone(&state));

        let (addr, shutdown) = spawn(app).await?;
        Ok(Self { addr, shutdown, state })
    }

    pub async fn replying(content: &str) -> anyhow::Result<Self> {
        Self::start(Behavior::Reply(content.to_owned())).await
    }

    pub async fn failing(status: u16) -> anyhow::Result<Self> {
        Self::start(Behavior::Fail(status)).await
    }

    /// Base URL including `/v1`, as the client appends `chat/completions`
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn completion_count(&self) -> u32 {
        self.state.completion_count.load(Ordering::Relaxed)
    }

    /// Bodies of every completion request received, oldest first
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for MockOpenAi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn openai_completions(State(state): State<Arc<OpenAiState>>, Json(request): Json<Value>) -> Response {
    state.completion_count.fetch_add(1, Ordering::Relaxed);
    state.requests.lock().unwrap().push(request.clone());

    let model = request["model"].as_str().unwrap_or_default().to_owned();
    let streaming = request["stream"].as_bool().unwrap_or(false);

    match &state.behavior {
        Behavior::Fail(status) => (
            StatusCode::from_u16(*status).unwrap(),
            Json(json!({"error": {"message": "mock server intentional failure", "type": "server_error"}})),
        )
            .into_response(),
        Behavior::Reply(content) if streaming => sse_response(Body::from(openai_stream(&model, content))),
        Behavior::Reply(content) => Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
        .into_response(),
        Behavior::BreakMidStream => {
            let first = sse_frame(&openai_chunk(&model, json!({"role": "assistant", "content": "partial"}), None));
            // Delay the reset until the first frame has been flushed
            let frames = stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(first)) }).chain(stream::once(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"))
            }));
            sse_response(Body::from_stream(frames))
        }
    }
}

fn openai_chunk(model: &str, delta: Value, finish_reason: Option<&str>) -> String {
    json!({
        "id": "chatcmpl-mock-stream",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    })
    .to_string()
}

fn openai_stream(model: &str, content: &str) -> String {
    let mut body = String::new();
    for (i, word) in content.split_inclusive(' ').enumerate() {
        let delta = if i == 0 {
            json!({"role": "assistant", "content": word})
        } else {
            json!({"content": word})
        };
        body.push_str(&sse_frame(&openai_chunk(model, delta, None)));
    }
    body.push_str(&sse_frame(&openai_chunk(model, json!({}), Some("stop"))));
    body.push_str(&sse_frame("[DONE]"));
    body
}

async fn openai_models() -> Json<Value> {
    Json(json!({"object": "list", "data": [{"id": "mock-model", "object": "model", "created": 0, "owned_by": "mock"}]}))
}

/// Mock stateful conversation backend
pub struct MockThreaded {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<ThreadedState>,
}

struct ThreadedState {
    delay: Duration,
    conversations: AtomicU32,
    messages: AtomicU32,
    turns: Mutex<Vec<RecordedTurn>>,
}

/// One turn as received by the mock
#[derive(Debug, Clone)]
pub struct RecordedTurn {
    pub conversation_id: String,
    pub body: Value,
}

impl RecordedTurn {
    pub fn prompt(&self) -> &str {
        self.body["prompt"].as_str().unwrap_or_default()
    }

    pub fn parent_message_id(&self) -> Option<&str> {
        self.body["parent_message_id"].as_str()
    }
}

impl MockThreaded {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with_delay(Duration::ZERO).await
    }

    /// Start a mock that holds every turn for `delay` before answering
    pub async fn start_with_delay(delay: Duration) -> anyhow::Result<Self> {
        let state = Arc::new(ThreadedState {
            delay,
            conversations: AtomicU32::new(0),
            messages: AtomicU32::new(0),
            turns: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/conversations", routing::post(create_conversation))
            .route("/conversations/{id}/messages", routing::post(post_turn))
            .route("/health", routing::get(|| async { StatusCode::OK }))
            .with_state(Arc::clone(&state));

        let (addr, shutdown) = spawn(app).await?;
        Ok(Self { addr, shutdown, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of conversations created so far
    pub fn conversation_count(&self) -> u32 {
        self.state.conversations.load(Ordering::Relaxed)
    }

    pub fn turns(&self) -> Vec<RecordedTurn> {
        self.state.turns.lock().unwrap().clone()
    }
}

impl Drop for MockThreaded {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn create_conversation(State(state): State<Arc<ThreadedState>>) -> Json<Value> {
    let n = state.conversations.fetch_add(1, Ordering::Relaxed) + 1;
    Json(json!({"id": format!("conv-{n}")}))
}

async fn post_turn(
    State(state): State<Arc<ThreadedState>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.turns.lock().unwrap().push(RecordedTurn {
        conversation_id: conversation_id.clone(),
        body: body.clone(),
    });

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let n = state.messages.fetch_add(1, Ordering::Relaxed) + 1;
    let message_id = format!("msg-{n}");
    let content = format!("reply {n}");

    if body["stream"].as_bool().unwrap_or(false) {
        let mut frames = String::new();
        frames.push_str(&sse_frame(&json!({"type": "start", "message_id": message_id}).to_string()));
        frames.push_str(&sse_frame(&json!({"type": "delta", "content": content}).to_string()));
        frames.push_str(&sse_frame(
            &json!({"type": "finish", "finish_reason": "stop", "usage": {"input_tokens": 4, "output_tokens": 2}})
                .to_string(),
        ));
        frames.push_str(&sse_frame("[DONE]"));
        return sse_response(Body::from(frames));
    }

    Json(json!({
        "conversation_id": conversation_id,
        "message_id": message_id,
        "content": content,
        "finish_reason": "stop",
        "usage": {"input_tokens": 4, "output_tokens": 2}
    }))
    .into_response()
}
