//! Upstream agent HTTP client.

use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::{UpstreamError, UpstreamResult};
use crate::config::UpstreamConfig;

/// Identity of the downstream caller, forwarded on every upstream request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
    /// Value of the configured identity header.
    pub user: Option<String>,
}

/// Client for the upstream agent's command and stream endpoints.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    /// Client for commands (bounded by the request timeout).
    commands: Client,
    /// Client for streams (connect timeout only).
    streams: Client,
    /// Base URL without trailing slash (e.g., "http://localhost:8000").
    base_url: String,
    identity_header: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> UpstreamResult<Self> {
        let commands = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;
        let streams = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| UpstreamError::Client(e.to_string()))?;

        Ok(Self {
            commands,
            streams,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            identity_header: config.identity_header.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session_url(&self, session_id: &str, endpoint: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, session_id, endpoint)
    }

    /// Open the agent's event stream for a session.
    ///
    /// Returns the response only once the agent answered with a success
    /// status; the body is left unread.
    pub async fn open_stream(
        &self,
        session_id: &str,
        identity: &CallerIdentity,
    ) -> UpstreamResult<Response> {
        let url = self.session_url(session_id, "stream");
        let request = self
            .streams
            .get(&url)
            .header("Accept", "text/event-stream");
        let response = self
            .with_identity(request, identity)
            .send()
            .await
            .map_err(|e| UpstreamError::Unreachable {
                url: url.clone(),
                message: e.to_string(),
            })?;

        ensure_success(response).await
    }

    /// POST a JSON command and decode the JSON answer.
    pub async fn post_json<B, T>(
        &self,
        url: &str,
        body: &B,
        identity: &CallerIdentity,
    ) -> UpstreamResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.commands.post(url).json(body);
        let response = self
            .with_identity(request, identity)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    UpstreamError::Unreachable {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                } else {
                    UpstreamError::Transport(e)
                }
            })?;

        let response = ensure_success(response).await?;
        response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }

    fn with_identity(&self, request: RequestBuilder, identity: &CallerIdentity) -> RequestBuilder {
        let mut request = request;
        if let Some(auth) = identity.authorization.as_deref() {
            request = request.header("Authorization", auth);
        }
        if let Some(user) = identity.user.as_deref() {
            request = request.header(self.identity_header.as_str(), user);
        }
        request
    }
}

/// Turn a non-success response into [`UpstreamError::Status`], keeping the
/// agent's own error message when it sent one.
async fn ensure_success(response: Response) -> UpstreamResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status {
        status: status.as_u16(),
        message: error_message(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
    })
}

fn error_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "message", "detail"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return Some(text.to_string());
            }
        }
    }
    Some(body.to_string())
}
