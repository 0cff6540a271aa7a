//! Transcript message types.
//!
//! Messages are the persistent units of a conversation. They are replayed from
//! history on recovery and rendered in insertion order by the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within the conversation.
    #[serde(default = "new_message_id")]
    pub id: String,

    /// Message role.
    pub role: Role,

    /// Rendered text content.
    #[serde(default)]
    pub content: String,

    /// When the message was created.
    #[serde(default = "Utc::now", alias = "created_at")]
    pub timestamp: DateTime<Utc>,

    /// True while tokens are still being appended.
    #[serde(default)]
    pub streaming: bool,

    /// Tool invocations made while producing this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Artifacts explicitly produced by this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_refs: Vec<ArtifactRef>,

    /// Artifact types this message announces (pipeline completion summaries).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_types: Vec<String>,

    /// Files the user attached.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<MessageAttachment>,

    /// Marks a message as internal bookkeeping, never displayed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,

    /// Optional message classification written by the upstream agent
    /// (e.g. "control").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
            tool_calls: Vec::new(),
            artifact_refs: Vec::new(),
            artifact_types: Vec::new(),
            attachments: Vec::new(),
            internal: false,
            kind: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant message that is still receiving tokens.
    pub fn streaming_assistant(content: impl Into<String>) -> Self {
        Self {
            streaming: true,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Whether the message only carries control information for the agent
    /// and must not be shown in a transcript.
    pub fn is_control(&self) -> bool {
        if self.internal {
            return true;
        }
        if matches!(self.kind.as_deref(), Some("control") | Some("internal")) {
            return true;
        }
        self.role == Role::User && self.content.trim().is_empty() && self.attachments.is_empty()
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: Option<Value>) -> Self {
        Self {
            name: name.into(),
            input,
            result: None,
        }
    }
}

/// Reference to an artifact produced by the workflow.
///
/// Identity is `id`. `artifact_type` is a secondary uniqueness dimension:
/// a newer artifact of a known type supersedes the older one for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "subjectId")]
    pub subject_id: Option<String>,
    #[serde(default = "Utc::now", alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl ArtifactRef {
    pub fn new(id: impl Into<String>, artifact_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            artifact_type: artifact_type.into(),
            title: String::new(),
            subject_id: None,
            created_at: Utc::now(),
            version: None,
        }
    }
}

/// Metadata of a file attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub filename: String,
    pub content_type: String,
}
