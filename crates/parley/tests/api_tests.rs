//! API integration tests against an in-process fake agent.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use futures::StreamExt;
use parley::history::SubjectRecord;
use parley_protocol::Message;
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{COMPLETE_STREAM, spawn_agent, test_app, unreachable_url};

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn post_json(app: Router, uri: &str, body: Value) -> axum::response::Response {
    app.oneshot(
        Request::builder()
            .uri(uri)
            .method(Method::POST)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer token-1")
            .header("x-user-id", "alice")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
    )
    .await
    .unwrap()
}

async fn get(app: Router, uri: &str) -> axum::response::Response {
    app.oneshot(
        Request::builder()
            .uri(uri)
            .method(Method::GET)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

/// Read a streamed body to its end, with a deadline.
async fn read_stream(response: axum::response::Response) -> String {
    let mut stream = response.into_body().into_data_stream();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
    })
    .await
    .expect("stream did not finish");
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = test_app(&unreachable_url().await).await;

    let response = get(app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

// ============================================================================
// Stream relay
// ============================================================================

#[tokio::test]
async fn test_stream_relays_frames_unmodified() {
    let (url, _agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = get(app, "/api/sessions/s1/stream").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );

    assert_eq!(read_stream(response).await, COMPLETE_STREAM);
}

#[tokio::test]
async fn test_stream_reports_unreachable_upstream_as_error_event() {
    let (app, _) = test_app(&unreachable_url().await).await;

    let response = get(app, "/api/sessions/s1/stream").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = read_stream(response).await;
    assert!(body.starts_with("event: error\n"), "got {body:?}");
    assert!(body.contains("upstream_unavailable"));
    assert!(body.ends_with("\n\n"));
}

#[tokio::test]
async fn test_stream_reports_upstream_status_as_error_event() {
    let (url, _agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let body = read_stream(get(app, "/api/sessions/missing/stream").await).await;
    assert!(body.contains("event: error"));
    assert!(body.contains("upstream_status_404"));
    assert!(body.contains("unknown session"));
}

#[tokio::test]
async fn test_client_disconnect_cancels_upstream_stream() {
    let (url, agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = get(app, "/api/sessions/hang/stream").await;
    let mut stream = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.starts_with(b"event: token"));

    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), agent.stream_closed.notified())
        .await
        .expect("upstream stream was not released after disconnect");
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_send_forwards_message_and_identity() {
    let (url, agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(
        app,
        "/api/chat/send",
        json!({"session_id": "s1", "text": "hello", "subject_id": "subj-1"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["session_id"], "s1");
    assert_eq!(json["message_id"], "m-1");
    assert_eq!(json["status"], "accepted");

    let received = agent.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].path, "/sessions/s1/messages");
    assert_eq!(received[0].body["text"], "hello");
    assert_eq!(received[0].user.as_deref(), Some("alice"));
    assert_eq!(received[0].authorization.as_deref(), Some("Bearer token-1"));
}

#[tokio::test]
async fn test_send_propagates_upstream_rejection() {
    let (url, _agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(
        app,
        "/api/chat/send",
        json!({"session_id": "busy", "text": "hello"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let json = body_json(response).await;
    assert_eq!(json["code"], "UPSTREAM_ERROR");
    assert!(json["error"].as_str().unwrap().contains("session busy"));
}

#[tokio::test]
async fn test_send_without_session_is_bad_request() {
    let (url, agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(app, "/api/chat/send", json!({"session_id": "", "text": "x"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(agent.received().is_empty());
}

#[tokio::test]
async fn test_send_with_unreachable_upstream_is_bad_gateway() {
    let (app, _) = test_app(&unreachable_url().await).await;

    let response = post_json(app, "/api/chat/send", json!({"session_id": "s1", "text": "x"})).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_retry_forwards_edited_content() {
    let (url, agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(
        app,
        "/api/chat/retry",
        json!({
            "session_id": "s1",
            "message_id": "m-4",
            "original_content": "show sales",
            "edited_content": "show revenue"
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = agent.received();
    assert_eq!(received[0].path, "/sessions/s1/retry");
    assert_eq!(received[0].body["edited_content"], "show revenue");
    assert_eq!(received[0].body["message_id"], "m-4");
}

#[tokio::test]
async fn test_retry_without_anchor_is_rejected() {
    let (url, agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(app, "/api/chat/retry", json!({"session_id": "s1"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(agent.received().is_empty());
}

#[tokio::test]
async fn test_interrupt_running_session() {
    let (url, _agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(app, "/api/chat/interrupt", json!({"session_id": "s1"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "interrupted");
}

#[tokio::test]
async fn test_interrupt_idle_session_succeeds() {
    let (url, _agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(app, "/api/chat/interrupt", json!({"session_id": "idle"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "idle");
}

#[tokio::test]
async fn test_interrupt_failure_is_propagated() {
    let (url, _agent) = spawn_agent().await;
    let (app, _) = test_app(&url).await;

    let response = post_json(app, "/api/chat/interrupt", json!({"session_id": "broken"})).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("agent crashed")
    );
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn test_history_unknown_session_is_not_found() {
    let (app, _) = test_app(&unreachable_url().await).await;

    let response = get(app, "/api/sessions/nope/history").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_history_from_durable_tier() {
    let (app, history) = test_app(&unreachable_url().await).await;

    let mut subject = SubjectRecord::new("subj-1");
    subject.session_id = Some("s1".to_string());
    subject.phase = Some("analysis".to_string());
    subject.messages = vec![Message::user("hi"), Message::assistant("hello")];
    history.record_subject(&subject).await.unwrap();

    let response = get(app.clone(), "/api/sessions/s1/history").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["session_id"], "s1");
    assert_eq!(json["subject_id"], "subj-1");
    assert_eq!(json["phase"], "analysis");
    assert_eq!(json["messages"].as_array().unwrap().len(), 2);
    assert_eq!(json["messages"][1]["content"], "hello");

    let response = get(app, "/api/subjects/subj-1/session").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["session_id"], "s1");
    assert_eq!(json["phase"], "analysis");
}

#[tokio::test]
async fn test_subject_session_unknown_subject() {
    let (app, _) = test_app(&unreachable_url().await).await;

    let response = get(app, "/api/subjects/ghost/session").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
