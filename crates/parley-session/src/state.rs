//! Per-conversation state container.

use parley_protocol::{ApprovalRequest, ArtifactRef, Message, PipelineProgress};
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle of the session's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Streaming,
    Error,
}

/// One conversation with the agent about a workflow subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub subject_id: Option<String>,
    /// Current workflow phase. Usually moves forward; a rerun may re-enter an
    /// earlier one.
    pub phase: Option<String>,
    /// Data-maturity tier of the subject.
    pub tier: Option<String>,
    pub streaming: bool,
}

impl Session {
    /// A new session with a generated id.
    pub fn new(subject_id: Option<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), subject_id)
    }

    pub fn with_id(id: impl Into<String>, subject_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            subject_id,
            phase: None,
            tier: None,
            streaming: false,
        }
    }
}

/// Everything the client knows about one open conversation.
///
/// Built per conversation and dropped on navigation; never shared between
/// conversations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub session: Session,
    pub status: SessionStatus,
    /// Transcript in insertion order. At most one message is streaming and it
    /// is always the last one.
    pub messages: Vec<Message>,
    /// Known artifacts, at most one per type.
    pub artifacts: Vec<ArtifactRef>,
    /// Transient pipeline progress, never persisted.
    pub progress: Option<PipelineProgress>,
    pub pending_approval: Option<ApprovalRequest>,
}

impl SessionState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            status: SessionStatus::Idle,
            messages: Vec::new(),
            artifacts: Vec::new(),
            progress: None,
            pending_approval: None,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.last().filter(|m| m.streaming)
    }

    pub fn artifact_of_type(&self, artifact_type: &str) -> Option<&ArtifactRef> {
        self.artifacts
            .iter()
            .find(|a| a.artifact_type == artifact_type)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(Session::new(None))
    }
}
