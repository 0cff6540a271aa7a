//! HTTP handlers for commands, history and the event stream.

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Response, StatusCode, header},
};
use parley_protocol::{
    CommandAck, HistoryResponse, InterruptRequest, RetryRequest, SendMessageRequest,
    SubjectSessionResponse,
};
use serde::Serialize;
use tracing::{debug, error, instrument};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::upstream::CallerIdentity;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Identity of the caller, taken from the incoming request headers.
fn caller_identity(headers: &HeaderMap, state: &AppState) -> CallerIdentity {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    CallerIdentity {
        authorization: header_str(header::AUTHORIZATION.as_str()),
        user: header_str(&state.identity_header),
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// Relay the upstream event stream of a session.
///
/// The response is committed immediately; upstream failures arrive as a
/// terminal `error` event on the stream rather than as an HTTP status.
#[instrument(skip(state, headers))]
pub async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response<Body>, StatusCode> {
    let identity = caller_identity(&headers, &state);
    let stream = state.relay.open(session_id, identity);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no") // Disable nginx buffering if present
        .body(Body::from_stream(stream))
        .map_err(|e| {
            error!("Failed to build SSE response: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

// ============================================================================
// Commands
// ============================================================================

/// Forward a user message to the agent.
#[instrument(skip(state, headers, request), fields(session_id = %request.session_id))]
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Json<CommandAck>> {
    let identity = caller_identity(&headers, &state);
    let ack = state.dispatcher.send_message(&request, &identity).await?;
    debug!(message_id = ?ack.message_id, status = %ack.status, "message accepted");
    Ok(Json(ack))
}

/// Ask the agent to regenerate from a specific point.
#[instrument(skip(state, headers, request), fields(session_id = %request.session_id))]
pub async fn retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RetryRequest>,
) -> ApiResult<Json<CommandAck>> {
    let identity = caller_identity(&headers, &state);
    let ack = state.dispatcher.retry(&request, &identity).await?;
    Ok(Json(ack))
}

/// Cancel in-flight generation.
#[instrument(skip(state, headers, request), fields(session_id = %request.session_id))]
pub async fn interrupt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InterruptRequest>,
) -> ApiResult<Json<CommandAck>> {
    let identity = caller_identity(&headers, &state);
    let ack = state.dispatcher.interrupt(&request, &identity).await?;
    Ok(Json(ack))
}

// ============================================================================
// History
// ============================================================================

/// Past messages of a session, from cache or durable storage.
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<HistoryResponse>> {
    let record = state
        .history
        .get_history(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No history for session {session_id}")))?;

    debug!(count = record.messages.len(), "history loaded");
    Ok(Json(HistoryResponse {
        session_id: record.session_id,
        subject_id: record.subject_id,
        messages: record.messages,
        phase: record.phase,
    }))
}

/// Session currently persisted for a workflow subject.
#[instrument(skip(state))]
pub async fn get_subject_session(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> ApiResult<Json<SubjectSessionResponse>> {
    let subject = state
        .history
        .subject(&subject_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Subject not found: {subject_id}")))?;

    Ok(Json(SubjectSessionResponse {
        subject_id: subject.id,
        session_id: subject.session_id,
        phase: subject.phase,
        tier: subject.tier,
    }))
}
