#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use llmgate::cipher::CredentialCipher;
use llmgate::dispatcher::{DispatcherOptions, RequestDispatcher};
use llmgate::registry::{RegistryOptions, VendorRegistry, VendorSpec};
use llmgate::store::StoreBackend;
use llmgate::store_memory::MemoryStore;
use llmgate::util::build_http_client;

pub const TEST_SECRET: &str = "integration-test-secret";

/// What the mock vendor does for one chat call.
#[derive(Clone)]
pub enum Reply {
    Json(Value),
    Status(u16, Value),
    Text(&'static str),
    /// Answers long after any test timeout.
    Hang,
    /// SSE chunks, optionally followed by an abrupt connection failure.
    Sse { chunks: Vec<&'static str>, fail: bool },
    /// Endless chunks; the flag flips once the server drops the body.
    Ticks(Arc<AtomicBool>),
    /// Error status whose body breaks off after the first bytes.
    BrokenStatus(u16),
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub body: Value,
    pub authorization: Option<String>,
}

#[derive(Clone)]
struct MockState {
    script: Arc<Vec<Reply>>,
    hits: Arc<AtomicUsize>,
    requests: Arc<AsyncMutex<Vec<Recorded>>>,
    cancelled: Arc<AsyncMutex<Vec<String>>>,
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn handle_chat(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().await.push(Recorded {
        body: payload,
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
    let reply = state.script[n.min(state.script.len() - 1)].clone();
    render(reply).await
}

async fn render(reply: Reply) -> Response {
    match reply {
        Reply::Json(v) => Json(v).into_response(),
        Reply::Status(code, v) => {
            (StatusCode::from_u16(code).expect("valid status"), Json(v)).into_response()
        }
        Reply::Text(t) => (StatusCode::OK, t).into_response(),
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Json(json!({})).into_response()
        }
        Reply::Sse { chunks, fail } => {
            let stream = async_stream::stream! {
                for chunk in chunks {
                    yield Ok::<Bytes, std::io::Error>(Bytes::from_static(chunk.as_bytes()));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                if fail {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    yield Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "vendor dropped"));
                }
            };
            sse(Body::from_stream(stream))
        }
        Reply::Ticks(flag) => {
            let stream = async_stream::stream! {
                let _guard = ReleaseGuard(flag);
                loop {
                    yield Ok::<Bytes, std::io::Error>(Bytes::from_static(b"data: {\"tick\":true}\n\n"));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            sse(Body::from_stream(stream))
        }
        Reply::BrokenStatus(code) => {
            let stream = async_stream::stream! {
                yield Ok::<Bytes, std::io::Error>(Bytes::from_static(b"{\"error\":"));
                tokio::time::sleep(Duration::from_millis(20)).await;
                yield Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "vendor dropped"));
            };
            Response::builder()
                .status(code)
                .header("content-type", "application/json")
                .body(Body::from_stream(stream))
                .expect("broken response")
        }
    }
}

fn sse(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .expect("sse response")
}

async fn handle_cancel(State(state): State<MockState>, Path(id): Path<String>) -> Json<Value> {
    state.cancelled.lock().await.push(id.clone());
    Json(json!({ "id": id, "object": "chat.completion", "deleted": true }))
}

async fn handle_models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{ "id": "model-a", "object": "model" }, { "id": "model-b", "object": "model" }]
    }))
}

pub struct MockVendor {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<AsyncMutex<Vec<Recorded>>>,
    cancelled: Arc<AsyncMutex<Vec<String>>>,
    join: JoinHandle<()>,
}

impl MockVendor {
    pub async fn start(reply: Reply) -> Self {
        Self::scripted(vec![reply]).await
    }

    /// The n-th call gets `script[n]`; the last entry repeats.
    pub async fn scripted(script: Vec<Reply>) -> Self {
        assert!(!script.is_empty());
        let state = MockState {
            script: Arc::new(script),
            hits: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(AsyncMutex::new(Vec::new())),
            cancelled: Arc::new(AsyncMutex::new(Vec::new())),
        };
        let hits = state.hits.clone();
        let requests = state.requests.clone();
        let cancelled = state.cancelled.clone();

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat))
            .route("/v1/chat/completions/:id", delete(handle_cancel))
            .route("/v1/models", get(handle_models))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url: format!("http://{}/v1", addr),
            hits,
            requests,
            cancelled,
            join,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn last_request(&self) -> Recorded {
        self.requests
            .lock()
            .await
            .last()
            .cloned()
            .expect("vendor saw no request")
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }
}

impl Drop for MockVendor {
    fn drop(&mut self) {
        self.join.abort();
    }
}

pub fn vendor_spec(slug: &str, base_url: &str, api_key: Option<&str>) -> VendorSpec {
    VendorSpec {
        slug: slug.into(),
        base_url: Some(base_url.into()),
        default_model: Some("gpt-test".into()),
        api_key: api_key.map(str::to_string),
        timeout_seconds: Some(5),
        retry_count: Some(2),
        ..Default::default()
    }
}

pub fn fast_dispatch_options() -> DispatcherOptions {
    DispatcherOptions {
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        stream_buffer: 4,
    }
}

pub fn registry(store: Arc<dyn StoreBackend>, options: RegistryOptions) -> Arc<VendorRegistry> {
    Arc::new(VendorRegistry::new(
        store,
        CredentialCipher::new(TEST_SECRET).expect("cipher"),
        options,
    ))
}

/// Registry over a fresh memory store plus a dispatcher with fast backoff.
pub fn gateway(options: RegistryOptions) -> (Arc<VendorRegistry>, RequestDispatcher) {
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
    let registry = registry(store, options);
    let http = build_http_client(None, true).expect("http client");
    let dispatcher = RequestDispatcher::new(http, registry.clone(), fast_dispatch_options());
    (registry, dispatcher)
}
