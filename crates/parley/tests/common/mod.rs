//! Test utilities: a gateway wired to an in-process fake agent.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Response, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use bytes::Bytes;
use parley::api::{self, AppState};
use parley::config::AppConfig;
use parley::db::Database;
use parley::history::{HistoryStore, MemoryCache, SubjectRepository};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// A command the fake agent received.
#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub body: Value,
    pub user: Option<String>,
    pub authorization: Option<String>,
}

/// Shared state of the fake agent.
#[derive(Clone, Default)]
pub struct FakeAgent {
    pub received: Arc<Mutex<Vec<Received>>>,
    /// Notified when a downstream relay drops its upstream stream.
    pub stream_closed: Arc<Notify>,
}

impl FakeAgent {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    fn record(&self, path: String, headers: &HeaderMap, body: Value) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.received.lock().unwrap().push(Received {
            path,
            body,
            user: header("x-user-id"),
            authorization: header("authorization"),
        });
    }
}

/// Frames served for a session that completes normally.
pub const COMPLETE_STREAM: &str = concat!(
    "event: token\ndata: {\"text\":\"Hel\"}\n\n",
    "event: token\ndata: {\"text\":\"lo\"}\n\n",
    "event: message_done\ndata: {}\n\n",
    "event: done\ndata: {}\n\n",
);

async fn agent_stream(
    State(agent): State<FakeAgent>,
    Path(session_id): Path<String>,
) -> axum::response::Response {
    match session_id.as_str() {
        "missing" => (StatusCode::NOT_FOUND, Json(json!({"detail": "unknown session"})))
            .into_response(),
        "hang" => {
            // One frame, then hold the stream open until the reader goes away.
            let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(4);
            let closed = agent.stream_closed.clone();
            tokio::spawn(async move {
                let _ = tx
                    .send(Ok(Bytes::from_static(b"event: token\ndata: {\"text\":\"Hi\"}\n\n")))
                    .await;
                tx.closed().await;
                closed.notify_one();
            });
            sse_response(Body::from_stream(ReceiverStream::new(rx)))
        }
        _ => sse_response(Body::from(COMPLETE_STREAM)),
    }
}

fn sse_response(body: Body) -> axum::response::Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

async fn agent_messages(
    State(agent): State<FakeAgent>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    agent.record(format!("/sessions/{session_id}/messages"), &headers, body);
    if session_id == "busy" {
        return (StatusCode::CONFLICT, Json(json!({"detail": "session busy"}))).into_response();
    }
    Json(json!({"message_id": "m-1"})).into_response()
}

async fn agent_retry(
    State(agent): State<FakeAgent>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    agent.record(format!("/sessions/{session_id}/retry"), &headers, body);
    Json(json!({"status": "accepted"})).into_response()
}

async fn agent_interrupt(
    State(agent): State<FakeAgent>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    agent.record(format!("/sessions/{session_id}/interrupt"), &headers, body);
    match session_id.as_str() {
        "idle" => (StatusCode::CONFLICT, "nothing to interrupt").into_response(),
        "broken" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "agent crashed"})),
        )
            .into_response(),
        _ => Json(json!({"status": "interrupted"})).into_response(),
    }
}

/// Start the fake agent on an ephemeral port and return its base URL.
pub async fn spawn_agent() -> (String, FakeAgent) {
    let agent = FakeAgent::default();
    let app = Router::new()
        .route("/sessions/{session_id}/stream", get(agent_stream))
        .route("/sessions/{session_id}/messages", post(agent_messages))
        .route("/sessions/{session_id}/retry", post(agent_retry))
        .route("/sessions/{session_id}/interrupt", post(agent_interrupt))
        .with_state(agent.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), agent)
}

/// Base URL on which nothing listens.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub fn test_config(upstream_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.base_url = upstream_url.to_string();
    config.upstream.connect_timeout_secs = 2;
    config.upstream.request_timeout_secs = 5;
    config.relay.heartbeat_interval_secs = 30;
    config
}

/// Create a gateway pointed at `upstream_url`, with an in-memory database.
pub async fn test_app(upstream_url: &str) -> (Router, HistoryStore) {
    let db = Database::in_memory().await.unwrap();
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
    let history = HistoryStore::new(cache, SubjectRepository::new(db.pool().clone()));

    let state = AppState::new(&test_config(upstream_url), history.clone()).unwrap();
    (api::create_router(state), history)
}
