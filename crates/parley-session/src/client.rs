//! HTTP client for the Parley gateway.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parley_protocol::{
    CommandAck, HistoryResponse, InterruptRequest, RetryRequest, SendMessageRequest, StreamEvent,
    SubjectSessionResponse, decode_frame,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource, retry::Never};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::recovery::HistorySource;

/// Errors from the gateway client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),

    #[error("event stream failed: {0}")]
    Stream(String),

    #[error("stream cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether repeating the call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) | Self::InvalidUrl(_) | Self::Stream(_) | Self::Cancelled => {
                false
            }
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client for one gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    /// Commands and history reads (bounded by a request timeout).
    commands: Client,
    /// Event streams (connect timeout only).
    streams: Client,
    base_url: Url,
    /// Sent as `Authorization: Bearer <token>` when set.
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        Self::with_timeouts(base_url, Duration::from_secs(10), Duration::from_secs(120))
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> ClientResult<Self> {
        let commands = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        let streams = Client::builder().connect_timeout(connect_timeout).build()?;

        let base_url = base_url.into();
        let parsed = Url::parse(&base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url));
        }
        Ok(Self {
            commands,
            streams,
            base_url: parsed,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn send_message(&self, request: &SendMessageRequest) -> ClientResult<CommandAck> {
        self.post(&["api", "chat", "send"], request).await
    }

    pub async fn retry(&self, request: &RetryRequest) -> ClientResult<CommandAck> {
        self.post(&["api", "chat", "retry"], request).await
    }

    pub async fn interrupt(&self, session_id: &str) -> ClientResult<CommandAck> {
        let request = InterruptRequest {
            session_id: session_id.to_string(),
        };
        self.post(&["api", "chat", "interrupt"], &request).await
    }

    /// Stored history of a session; `None` when the gateway has none.
    pub async fn history(&self, session_id: &str) -> ClientResult<Option<HistoryResponse>> {
        self.get_optional(&["api", "sessions", session_id, "history"])
            .await
    }

    /// Session persisted for a workflow subject; `None` for an unknown subject.
    pub async fn subject_session(
        &self,
        subject_id: &str,
    ) -> ClientResult<Option<SubjectSessionResponse>> {
        self.get_optional(&["api", "subjects", subject_id, "session"])
            .await
    }

    /// Open the event stream of a session.
    ///
    /// Events are decoded on a background task. The stream ends when the
    /// gateway closes it, when `cancel` fires, or when the returned
    /// [`EventStream`] is dropped; all three abort the HTTP request. A
    /// dropped connection is never reopened.
    pub async fn open_stream(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> ClientResult<EventStream> {
        let url = self.endpoint(&["api", "sessions", session_id, "stream"])?;
        let request = self
            .authorize(self.streams.get(url))
            .header("Accept", "text/event-stream");
        let mut source = EventSource::new(request)
            .map_err(|_| ClientError::InvalidResponse("stream request is not cloneable".into()))?;
        source.set_retry_policy(Box::new(Never));

        // The first item tells whether the gateway accepted the stream.
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                source.close();
                return Err(ClientError::Cancelled);
            }
            first = source.next() => first,
        };
        let pending = match first {
            Some(Ok(Event::Open)) => None,
            Some(Ok(Event::Message(frame))) => decode_frame(&frame.event, &frame.data),
            Some(Err(err)) => {
                source.close();
                return Err(stream_error(err).await);
            }
            None => {
                return Err(ClientError::Stream(
                    "stream closed before it opened".to_string(),
                ));
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let task_cancel = cancel.child_token();
        let guard = task_cancel.clone().drop_guard();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            debug!("event stream opened for session {}", session_id);
            decode_stream(source, pending, tx, task_cancel).await;
            debug!("event stream closed for session {}", session_id);
        });

        Ok(EventStream {
            inner: ReceiverStream::new(rx),
            _guard: guard,
        })
    }

    /// Absolute URL for `segments` below the base URL. Each segment is
    /// percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B, T>(&self, segments: &[&str], body: &B) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        let request = self.authorize(self.commands.post(url).json(body));
        let response = ensure_success(request.send().await?).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn get_optional<T: DeserializeOwned>(&self, segments: &[&str]) -> ClientResult<Option<T>> {
        let url = self.endpoint(segments)?;
        let response = self.authorize(self.commands.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl HistorySource for GatewayClient {
    async fn fetch_history(&self, session_id: &str) -> ClientResult<Option<HistoryResponse>> {
        self.history(session_id).await
    }
}

async fn ensure_success(response: Response) -> ClientResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(status_error(response).await)
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                body
            }
        });
    ClientError::Status {
        status: status.as_u16(),
        message,
    }
}

async fn stream_error(err: EventSourceError) -> ClientError {
    match err {
        EventSourceError::InvalidStatusCode(_, response) => status_error(response).await,
        EventSourceError::Transport(err) => ClientError::Http(err),
        EventSourceError::InvalidContentType(content_type, _) => {
            ClientError::InvalidResponse(format!("unexpected content type {content_type:?}"))
        }
        other => ClientError::Stream(other.to_string()),
    }
}

async fn decode_stream(
    mut source: EventSource,
    pending: Option<StreamEvent>,
    tx: mpsc::Sender<Result<StreamEvent, ClientError>>,
    cancel: CancellationToken,
) {
    if let Some(event) = pending
        && tx.send(Ok(event)).await.is_err()
    {
        source.close();
        return;
    }

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            item = source.next() => item,
        };

        match item {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(frame))) => {
                let Some(event) = decode_frame(&frame.event, &frame.data) else {
                    continue;
                };
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            Some(Err(EventSourceError::StreamEnded)) | None => {
                info!("event stream ended");
                break;
            }
            Some(Err(err)) => {
                warn!("event stream failed: {}", err);
                let _ = tx.send(Err(stream_error(err).await)).await;
                break;
            }
        }
    }
    source.close();
}

/// Decoded events of one session stream. Dropping it aborts the request.
pub struct EventStream {
    inner: ReceiverStream<Result<StreamEvent, ClientError>>,
    _guard: DropGuard,
}

impl Stream for EventStream {
    type Item = Result<StreamEvent, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
