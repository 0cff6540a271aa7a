//! Stream event vocabulary.
//!
//! Events are ephemeral signals emitted by the upstream agent on its stream.
//! They are not stored; the client folds them into a transcript in strict
//! arrival order.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::messages::ArtifactRef;

// ============================================================================
// Event vocabulary
// ============================================================================

/// Every event the upstream agent may emit.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text delta for the current assistant message.
    Token { text: String },

    /// The agent started a tool.
    ToolCall { name: String, input: Option<Value> },

    /// A tool finished.
    ToolResult { name: String, result: Value },

    /// Workflow phase moved (or re-entered).
    PhaseChange { from: Option<String>, to: String },

    /// An artifact was produced.
    Artifact(ArtifactRef),

    /// The agent needs a human decision before continuing.
    ApprovalRequest(ApprovalRequest),

    /// Progress of a multi-step workflow stage.
    PipelineProgress(PipelineProgress),

    /// The current assistant message is complete.
    MessageDone,

    /// The agent reported an error.
    Error { code: String, message: String },

    /// The run finished.
    Done,
}

/// Approval prompt raised by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Transient progress of a multi-step workflow stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub step: String,
    #[serde(default)]
    pub label: String,
    pub status: ProgressStatus,
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default, alias = "stepIndex")]
    pub step_index: u32,
    #[serde(default, alias = "totalSteps")]
    pub total_steps: u32,
    #[serde(default, alias = "overallPct")]
    pub overall_pct: f32,
}

/// Status of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    #[serde(alias = "in_progress")]
    Running,
    #[serde(alias = "complete", alias = "done")]
    Completed,
    #[serde(alias = "error")]
    Failed,
}

#[derive(Deserialize)]
struct TokenPayload {
    #[serde(alias = "content")]
    text: String,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    name: String,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct ToolResultPayload {
    name: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct PhaseChangePayload {
    #[serde(default)]
    from: Option<String>,
    to: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default = "default_error_code")]
    code: String,
    #[serde(default, alias = "error")]
    message: String,
}

fn default_error_code() -> String {
    "error".to_string()
}

impl StreamEvent {
    /// Wire name of the event (the `event:` field of its frame).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::PhaseChange { .. } => "phase_change",
            Self::Artifact(_) => "artifact",
            Self::ApprovalRequest(_) => "approval_request",
            Self::PipelineProgress(_) => "pipeline_progress",
            Self::MessageDone => "message_done",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// Decode an event from its wire name and `data` payload.
    ///
    /// Returns `None` for unknown names and malformed payloads.
    pub fn decode(name: &str, data: &str) -> Option<Self> {
        let data = if data.trim().is_empty() { "{}" } else { data };
        let decoded = match name {
            "token" => serde_json::from_str::<TokenPayload>(data)
                .map(|p| Self::Token { text: p.text }),
            "tool_call" => serde_json::from_str::<ToolCallPayload>(data).map(|p| Self::ToolCall {
                name: p.name,
                input: p.input,
            }),
            "tool_result" => {
                serde_json::from_str::<ToolResultPayload>(data).map(|p| Self::ToolResult {
                    name: p.name,
                    result: p.result,
                })
            }
            "phase_change" => {
                serde_json::from_str::<PhaseChangePayload>(data).map(|p| Self::PhaseChange {
                    from: p.from,
                    to: p.to,
                })
            }
            "artifact" => serde_json::from_str::<ArtifactRef>(data).map(Self::Artifact),
            "approval_request" => {
                serde_json::from_str::<ApprovalRequest>(data).map(Self::ApprovalRequest)
            }
            "pipeline_progress" => {
                serde_json::from_str::<PipelineProgress>(data).map(Self::PipelineProgress)
            }
            "message_done" => serde_json::from_str::<Value>(data).map(|_| Self::MessageDone),
            "error" => serde_json::from_str::<ErrorPayload>(data).map(|p| Self::Error {
                code: p.code,
                message: p.message,
            }),
            "done" => serde_json::from_str::<Value>(data).map(|_| Self::Done),
            other => {
                log::debug!("dropping event with unknown name {other:?}");
                return None;
            }
        };

        match decoded {
            Ok(event) => Some(event),
            Err(err) => {
                log::debug!("dropping malformed {name} frame: {err}");
                None
            }
        }
    }

    /// JSON payload carried in the `data` field.
    pub fn payload(&self) -> Value {
        match self {
            Self::Token { text } => json!({ "text": text }),
            Self::ToolCall { name, input } => json!({ "name": name, "input": input }),
            Self::ToolResult { name, result } => json!({ "name": name, "result": result }),
            Self::PhaseChange { from, to } => json!({ "from": from, "to": to }),
            Self::Artifact(artifact) => serde_json::to_value(artifact).unwrap_or(Value::Null),
            Self::ApprovalRequest(request) => serde_json::to_value(request).unwrap_or(Value::Null),
            Self::PipelineProgress(progress) => {
                serde_json::to_value(progress).unwrap_or(Value::Null)
            }
            Self::MessageDone | Self::Done => json!({}),
            Self::Error { code, message } => json!({ "code": code, "message": message }),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Encode an event as a complete `text/event-stream` frame.
pub fn encode_frame(event: &StreamEvent) -> String {
    format!("event: {}\ndata: {}\n\n", event.name(), event.payload())
}
