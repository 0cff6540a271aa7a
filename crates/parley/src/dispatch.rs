//! Non-streamed commands forwarded to the upstream agent.
//!
//! The dispatcher keeps no state. Every call is forwarded exactly once and
//! upstream failures are returned to the caller with their status and message.

use base64::Engine;
use log::{debug, info};
use parley_protocol::{CommandAck, InterruptRequest, RetryRequest, SendMessageRequest};
use serde::Deserialize;
use thiserror::Error;

use crate::upstream::{CallerIdentity, UpstreamClient, UpstreamError};

/// Errors returned by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command was rejected before contacting the agent.
    #[error("{0}")]
    Invalid(String),

    /// The agent rejected the command or could not be reached.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Ack as sent by the agent. Missing fields are filled from the request.
#[derive(Debug, Default, Deserialize)]
struct UpstreamAck {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl UpstreamAck {
    fn into_ack(self, session_id: &str, default_status: &str) -> CommandAck {
        CommandAck {
            session_id: self.session_id.unwrap_or_else(|| session_id.to_string()),
            message_id: self.message_id,
            status: self.status.unwrap_or_else(|| default_status.to_string()),
        }
    }
}

/// Thin proxy for `send`, `retry` and `interrupt`.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    upstream: UpstreamClient,
}

impl CommandDispatcher {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    /// Forward a user message. Output arrives on the session stream.
    pub async fn send_message(
        &self,
        request: &SendMessageRequest,
        identity: &CallerIdentity,
    ) -> Result<CommandAck, DispatchError> {
        require_session_id(&request.session_id)?;
        for attachment in &request.attachments {
            base64::engine::general_purpose::STANDARD
                .decode(attachment.data.as_bytes())
                .map_err(|e| {
                    DispatchError::Invalid(format!(
                        "attachment {} is not valid base64: {}",
                        attachment.filename, e
                    ))
                })?;
        }

        let url = self.upstream.session_url(&request.session_id, "messages");
        debug!(
            "forwarding message for session {} ({} attachments)",
            request.session_id,
            request.attachments.len()
        );
        let ack: UpstreamAck = self.upstream.post_json(&url, request, identity).await?;
        Ok(ack.into_ack(&request.session_id, "accepted"))
    }

    /// Ask the agent to regenerate from a message or from edited content.
    pub async fn retry(
        &self,
        request: &RetryRequest,
        identity: &CallerIdentity,
    ) -> Result<CommandAck, DispatchError> {
        require_session_id(&request.session_id)?;
        if !request.has_anchor() {
            return Err(DispatchError::Invalid(
                "retry needs a message_id, original_content or edited_content".to_string(),
            ));
        }

        let url = self.upstream.session_url(&request.session_id, "retry");
        debug!(
            "forwarding retry for session {} (message {:?})",
            request.session_id, request.message_id
        );
        let ack: UpstreamAck = self.upstream.post_json(&url, request, identity).await?;
        Ok(ack.into_ack(&request.session_id, "accepted"))
    }

    /// Cancel in-flight generation. Interrupting an idle session succeeds.
    pub async fn interrupt(
        &self,
        request: &InterruptRequest,
        identity: &CallerIdentity,
    ) -> Result<CommandAck, DispatchError> {
        require_session_id(&request.session_id)?;

        let url = self.upstream.session_url(&request.session_id, "interrupt");
        match self
            .upstream
            .post_json::<_, UpstreamAck>(&url, request, identity)
            .await
        {
            Ok(ack) => Ok(ack.into_ack(&request.session_id, "interrupted")),
            Err(UpstreamError::Status { status, .. }) if status == 404 || status == 409 => {
                info!(
                    "interrupt for session {} found nothing in flight",
                    request.session_id
                );
                Ok(CommandAck {
                    session_id: request.session_id.clone(),
                    message_id: None,
                    status: "idle".to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn require_session_id(session_id: &str) -> Result<(), DispatchError> {
    if session_id.trim().is_empty() {
        return Err(DispatchError::Invalid("session_id is required".to_string()));
    }
    Ok(())
}
