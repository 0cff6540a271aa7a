//! API route definitions.

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    // Tracing layer with request IDs and timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        // Event stream relay
        .route("/api/sessions/{session_id}/stream", get(handlers::stream_session))
        .route("/api/sessions/{session_id}/history", get(handlers::get_history))
        // Commands
        .route("/api/chat/send", post(handlers::send_message))
        .route("/api/chat/retry", post(handlers::retry))
        .route("/api/chat/interrupt", post(handlers::interrupt))
        // Workflow subjects
        .route(
            "/api/subjects/{subject_id}/session",
            get(handlers::get_subject_session),
        )
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        header::CACHE_CONTROL,
    ];
    let mut headers = headers.to_vec();
    match header::HeaderName::from_bytes(state.identity_header.as_bytes()) {
        Ok(name) => headers.push(name),
        Err(_) => tracing::warn!(
            "CORS: identity header is not a valid header name: {}",
            state.identity_header
        ),
    }

    if state.cors_origins.is_empty() {
        tracing::debug!("CORS: No origins configured, allowing any origin");
        return CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = state
        .cors_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    tracing::info!("CORS: Allowing origins: {:?}", origins);
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}
