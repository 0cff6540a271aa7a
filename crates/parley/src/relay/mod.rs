//! Stream relay between one downstream client and one upstream agent stream.
//!
//! Bytes are forwarded unmodified. The relay only adds two things of its own:
//! heartbeat comments whenever the stream sits at a line boundary, and a
//! single synthesized `error` frame when the upstream cannot be reached or
//! fails.
//!
//! Each relay owns a [`CancellationToken`]. Dropping the downstream body
//! cancels it, which drops the upstream response and aborts the request.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parley_protocol::{HEARTBEAT_FRAME, HEARTBEAT_LINE, StreamEvent, encode_frame};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::RelayConfig;
use crate::upstream::{CallerIdentity, UpstreamClient, UpstreamError};

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The upstream stream ended normally.
    Completed,
    /// The downstream client went away; the upstream request was cancelled.
    DownstreamClosed,
    /// The relay was cancelled externally.
    Cancelled,
    /// The upstream could not be opened or failed mid-stream.
    UpstreamFailed,
}

/// Opens relays for incoming stream requests.
#[derive(Debug, Clone)]
pub struct Relay {
    upstream: UpstreamClient,
    heartbeat: Duration,
    capacity: usize,
}

impl Relay {
    pub fn new(upstream: UpstreamClient, config: &RelayConfig) -> Self {
        Self {
            upstream,
            heartbeat: config.heartbeat_interval(),
            capacity: config.channel_capacity.max(1),
        }
    }

    /// Start relaying a session's upstream stream.
    ///
    /// The returned stream is meant to become a response body; it stays open
    /// until the upstream ends or fails.
    pub fn open(&self, session_id: String, identity: CallerIdentity) -> RelayStream {
        let (tx, rx) = mpsc::channel::<Bytes>(self.capacity);
        let cancel = CancellationToken::new();

        let upstream = self.upstream.clone();
        let heartbeat = self.heartbeat;
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            info!("relay opened for session {}", session_id);
            let outcome = run(upstream, &session_id, identity, tx, task_cancel, heartbeat).await;
            info!("relay for session {} ended: {:?}", session_id, outcome);
        });

        RelayStream {
            inner: ReceiverStream::new(rx),
            _guard: cancel.drop_guard(),
        }
    }
}

/// Downstream body of a relay. Dropping it cancels the upstream request.
pub struct RelayStream {
    inner: ReceiverStream<Bytes>,
    _guard: DropGuard,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

async fn run(
    upstream: UpstreamClient,
    session_id: &str,
    identity: CallerIdentity,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    heartbeat: Duration,
) -> RelayOutcome {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return RelayOutcome::Cancelled,
        _ = tx.closed() => return RelayOutcome::DownstreamClosed,
        opened = upstream.open_stream(session_id, &identity) => opened,
    };

    let response = match opened {
        Ok(response) => response,
        Err(err) => {
            warn!("failed to open upstream stream for session {}: {}", session_id, err);
            let _ = tx.send(error_frame(&err)).await;
            return RelayOutcome::UpstreamFailed;
        }
    };

    pump(response.bytes_stream(), tx, cancel, heartbeat).await
}

/// Forward upstream chunks to `tx`, interleaving heartbeats at line
/// boundaries, until the upstream ends, fails or either side cancels.
pub async fn pump<S, E>(
    upstream: S,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    heartbeat: Duration,
) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut boundary = FrameBoundary::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayOutcome::Cancelled,
            _ = tx.closed() => {
                cancel.cancel();
                return RelayOutcome::DownstreamClosed;
            }
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    boundary.observe(&bytes);
                    if tx.send(bytes).await.is_err() {
                        cancel.cancel();
                        return RelayOutcome::DownstreamClosed;
                    }
                }
                Some(Err(err)) => {
                    warn!("upstream stream failed: {}", err);
                    if !boundary.at_boundary() {
                        // Close the partial frame so the error frame parses on its own.
                        let _ = tx.send(Bytes::from_static(b"\n\n")).await;
                    }
                    let event = StreamEvent::error("upstream_stream_error", err.to_string());
                    let _ = tx.send(Bytes::from(encode_frame(&event))).await;
                    return RelayOutcome::UpstreamFailed;
                }
                None => return RelayOutcome::Completed,
            },
            _ = ticker.tick() => {
                let heartbeat = if boundary.at_boundary() {
                    HEARTBEAT_FRAME
                } else if boundary.at_line_boundary() {
                    HEARTBEAT_LINE
                } else {
                    debug!("skipping heartbeat inside a partially forwarded line");
                    continue;
                };
                debug!("sending heartbeat");
                if tx.send(Bytes::from_static(heartbeat.as_bytes())).await.is_err() {
                    cancel.cancel();
                    return RelayOutcome::DownstreamClosed;
                }
            }
        }
    }
}

/// Terminal error frame for an upstream that could not be opened.
pub fn error_frame(err: &UpstreamError) -> Bytes {
    let event = match err {
        UpstreamError::Unreachable { message, .. } => {
            StreamEvent::error("upstream_unavailable", message.clone())
        }
        UpstreamError::Status { status, message } => {
            StreamEvent::error(format!("upstream_status_{status}"), message.clone())
        }
        other => StreamEvent::error("upstream_error", other.to_string()),
    };
    Bytes::from(encode_frame(&event))
}

/// Tracks whether the forwarded byte stream currently sits between frames.
#[derive(Debug, Default)]
struct FrameBoundary {
    /// Last bytes forwarded (at most four).
    tail: Vec<u8>,
}

impl FrameBoundary {
    fn observe(&mut self, bytes: &[u8]) {
        self.tail.extend_from_slice(bytes);
        if self.tail.len() > 4 {
            let excess = self.tail.len() - 4;
            self.tail.drain(..excess);
        }
    }

    fn at_boundary(&self) -> bool {
        self.tail.is_empty() || self.tail.ends_with(b"\n\n") || self.tail.ends_with(b"\r\n\r\n")
    }

    /// A comment line may be inserted here without touching the frame.
    fn at_line_boundary(&self) -> bool {
        self.tail.is_empty() || self.tail.ends_with(b"\n")
    }
}
