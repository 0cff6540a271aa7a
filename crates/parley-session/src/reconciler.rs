//! Folds stream events into a transcript.
//!
//! Events are applied strictly in arrival order. The reconciler never does
//! I/O itself; anything that needs a timer comes back as an [`Effect`] for
//! the owner to schedule.

use std::time::Duration;

use chrono::TimeDelta;
use log::{debug, warn};
use parley_protocol::{
    ApprovalRequest, ArtifactRef, Message, MessageAttachment, PipelineProgress, ProgressStatus,
    Role, StreamEvent, ToolCall,
};
use serde_json::Value;

use crate::config::ReconcilerConfig;
use crate::state::{Session, SessionState, SessionStatus};

/// Work the owner of a reconciler must schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Call [`Reconciler::clear_progress`] with `generation` once `after`
    /// has elapsed.
    ScheduleProgressClear { generation: u64, after: Duration },
}

/// State machine over one conversation: `idle -> streaming -> idle | error`.
#[derive(Debug, Clone)]
pub struct Reconciler {
    state: SessionState,
    config: ReconcilerConfig,
    /// Bumped on every progress change; scheduled clears carry the value they
    /// were scheduled with and are ignored once it moved on.
    progress_generation: u64,
    /// Generation whose clear appends the completion message.
    completion_generation: Option<u64>,
    /// The completion is due but waits for the streaming message to finish.
    completion_deferred: bool,
}

impl Reconciler {
    pub fn new(session: Session, config: ReconcilerConfig) -> Self {
        Self {
            state: SessionState::new(session),
            config,
            progress_generation: 0,
            completion_generation: None,
            completion_deferred: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn into_state(self) -> SessionState {
        self.state
    }

    // ========================================================================
    // Stream events
    // ========================================================================

    /// Apply one stream event.
    pub fn apply(&mut self, event: StreamEvent) -> Vec<Effect> {
        match event {
            StreamEvent::Token { text } => self.append_token(&text),
            StreamEvent::MessageDone => {
                self.finalize_streaming();
                self.flush_completion();
            }
            StreamEvent::ToolCall { name, input } => self.record_tool_call(name, input),
            StreamEvent::ToolResult { name, result } => self.record_tool_result(&name, result),
            StreamEvent::PhaseChange { from, to } => self.change_phase(from, to),
            StreamEvent::Artifact(artifact) => self.upsert_artifact(artifact),
            StreamEvent::ApprovalRequest(request) => self.request_approval(request),
            StreamEvent::PipelineProgress(progress) => return self.update_progress(progress),
            StreamEvent::Error { code, message } => {
                self.stop(SessionStatus::Error);
                self.completion_generation = None;
                self.completion_deferred = false;
                let text = if message.trim().is_empty() {
                    format!("Error: {code}")
                } else {
                    message
                };
                self.state.messages.push(Message::system(text));
            }
            StreamEvent::Done => {
                self.stop(SessionStatus::Idle);
                self.flush_completion();
            }
        }
        Vec::new()
    }

    fn append_token(&mut self, text: &str) {
        self.state.status = SessionStatus::Streaming;
        self.state.session.streaming = true;

        if let Some(last) = self.state.messages.last_mut()
            && last.is_assistant()
            && last.streaming
        {
            last.content.push_str(text);
            return;
        }
        self.state.messages.push(Message::streaming_assistant(text));
    }

    /// Finalize the streaming message, dropping it if it replays the previous
    /// assistant message.
    fn finalize_streaming(&mut self) {
        let Some(index) = self.state.messages.len().checked_sub(1) else {
            return;
        };
        if !self.state.messages[index].streaming {
            return;
        }

        if self.is_replay(index) {
            let dropped = self.state.messages.remove(index);
            debug!("dropping replayed assistant message {}", dropped.id);
            return;
        }
        self.state.messages[index].streaming = false;
    }

    fn is_replay(&self, index: usize) -> bool {
        let candidate = &self.state.messages[index];
        let Some(prior) = self.state.messages[..index]
            .iter()
            .rev()
            .find(|m| m.is_assistant() && !m.streaming)
        else {
            return false;
        };

        let min = self.config.dedup_min_chars;
        if candidate.content.chars().count() <= min || prior.content.chars().count() <= min {
            return false;
        }

        let prefix = self.config.dedup_prefix_chars;
        candidate
            .content
            .chars()
            .take(prefix)
            .eq(prior.content.chars().take(prefix))
    }

    fn last_assistant_mut(&mut self) -> Option<&mut Message> {
        self.state.messages.iter_mut().rev().find(|m| m.is_assistant())
    }

    fn record_tool_call(&mut self, name: String, input: Option<Value>) {
        match self.last_assistant_mut() {
            Some(message) => message.tool_calls.push(ToolCall::new(name, input)),
            None => debug!("tool call {} arrived before any assistant message", name),
        }
    }

    fn record_tool_result(&mut self, name: &str, result: Value) {
        let call = self.last_assistant_mut().and_then(|message| {
            message
                .tool_calls
                .iter_mut()
                .rev()
                .find(|call| call.name == name && call.result.is_none())
        });
        match call {
            Some(call) => call.result = Some(result),
            None => debug!("tool result for {} has no open call", name),
        }
    }

    fn change_phase(&mut self, from: Option<String>, to: String) {
        let previous = self.state.session.phase.replace(to.clone());
        debug!("phase change {:?} -> {} (was {:?})", from, to, previous);
        if previous.as_deref() == Some(to.as_str()) {
            return;
        }

        if let Some(text) = self.config.announcement(&to) {
            let message = Message::assistant(text);
            self.finalize_streaming();
            self.state.messages.push(message);
        }
    }

    fn upsert_artifact(&mut self, artifact: ArtifactRef) {
        if self.state.artifacts.iter().any(|a| a.id == artifact.id) {
            return;
        }
        if let Some(existing) = self
            .state
            .artifacts
            .iter_mut()
            .find(|a| a.artifact_type == artifact.artifact_type)
        {
            debug!(
                "artifact {} supersedes {} ({})",
                artifact.id, existing.id, artifact.artifact_type
            );
            *existing = artifact;
            return;
        }
        self.state.artifacts.push(artifact);
    }

    fn request_approval(&mut self, request: ApprovalRequest) {
        self.finalize_streaming();
        if let Some(previous) = self.state.pending_approval.as_ref() {
            warn!(
                "approval for {} replaced by {} before it was resolved",
                previous.action, request.action
            );
        }
        self.state.pending_approval = Some(request);
    }

    fn update_progress(&mut self, progress: PipelineProgress) -> Vec<Effect> {
        self.progress_generation += 1;
        let generation = self.progress_generation;
        let terminal =
            progress.step == self.config.final_step && progress.status == ProgressStatus::Completed;
        self.state.progress = Some(progress);

        if !terminal {
            self.completion_generation = None;
            return Vec::new();
        }
        self.completion_generation = Some(generation);
        vec![Effect::ScheduleProgressClear {
            generation,
            after: self.config.progress_hold(),
        }]
    }

    /// End the run. The progress indicator is hidden; a completion that is
    /// already scheduled still lands.
    fn stop(&mut self, status: SessionStatus) {
        self.finalize_streaming();
        self.state.session.streaming = false;
        self.state.status = status;
        self.state.progress = None;
    }

    /// Clear a held progress indicator. Returns false for a stale generation.
    pub fn clear_progress(&mut self, generation: u64) -> bool {
        if generation != self.progress_generation {
            debug!(
                "ignoring stale progress clear {} (current {})",
                generation, self.progress_generation
            );
            return false;
        }

        self.state.progress = None;
        if self.completion_generation.take() == Some(generation) {
            if self.state.streaming_message().is_some() {
                debug!("completion waits for the streaming message to finish");
                self.completion_deferred = true;
            } else {
                self.append_completion_message();
            }
        }
        true
    }

    fn flush_completion(&mut self) {
        if std::mem::take(&mut self.completion_deferred) {
            self.append_completion_message();
        }
    }

    fn append_completion_message(&mut self) {
        let content = &self.config.completion_message;
        if self
            .state
            .last_message()
            .is_some_and(|m| m.content == *content)
        {
            debug!("completion message already present");
            return;
        }

        let types = &self.config.completion_artifact_types;
        let mut message = Message::assistant(content.clone());
        message.artifact_types = types.clone();
        message.artifact_refs = self
            .state
            .artifacts
            .iter()
            .filter(|a| types.contains(&a.artifact_type))
            .cloned()
            .collect();
        self.state.messages.push(message);
    }

    // ========================================================================
    // Local operations
    // ========================================================================

    /// Append a user message about to be sent upstream.
    pub fn push_user_message(
        &mut self,
        text: impl Into<String>,
        attachments: Vec<MessageAttachment>,
    ) -> Message {
        self.finalize_streaming();
        self.flush_completion();
        self.state.pending_approval = None;
        if self.state.status == SessionStatus::Error {
            self.state.status = SessionStatus::Idle;
        }

        let mut message = Message::user(text);
        message.attachments = attachments;
        self.state.messages.push(message.clone());
        message
    }

    /// Replace a message's content in place.
    pub fn edit_message(&mut self, id: &str, text: impl Into<String>) -> bool {
        match self.state.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.content = text.into();
                true
            }
            None => false,
        }
    }

    /// Keep every message up to and including `id`; drop the rest.
    pub fn truncate_after(&mut self, id: &str) -> bool {
        let Some(index) = self.state.messages.iter().position(|m| m.id == id) else {
            return false;
        };
        self.state.messages.truncate(index + 1);

        if self.state.streaming_message().is_none() && self.state.session.streaming {
            self.state.session.streaming = false;
            self.state.status = SessionStatus::Idle;
        }
        true
    }

    /// Re-enter a phase explicitly. The agent's following phase change to
    /// the same phase is then a re-entry and announces nothing.
    pub fn rerun_phase(&mut self, phase: impl Into<String>) {
        self.finalize_streaming();
        self.state.session.phase = Some(phase.into());
        self.state.progress = None;
        self.progress_generation += 1;
        self.completion_generation = None;
        self.completion_deferred = false;
    }

    /// Resolve the pending approval, returning it.
    pub fn resolve_approval(&mut self) -> Option<ApprovalRequest> {
        self.state.pending_approval.take()
    }

    /// Replace the transcript with messages recovered from history.
    pub fn hydrate(
        &mut self,
        session_id: impl Into<String>,
        messages: Vec<Message>,
        phase: Option<String>,
    ) {
        let subject_id = self.state.session.subject_id.clone();
        let mut session = Session::with_id(session_id, subject_id);
        session.phase = phase;
        session.tier = self.state.session.tier.take();
        self.reset(session);

        for mut message in messages {
            message.streaming = false;
            for artifact in &message.artifact_refs {
                self.upsert_artifact(artifact.clone());
            }
            self.state.messages.push(message);
        }
    }

    /// Start over with an empty transcript for `session`.
    pub fn reset(&mut self, session: Session) {
        self.state = SessionState::new(session);
        self.progress_generation += 1;
        self.completion_generation = None;
        self.completion_deferred = false;
    }

    pub fn set_tier(&mut self, tier: Option<String>) {
        self.state.session.tier = tier;
    }

    /// Artifacts to display with a message.
    ///
    /// Explicit references win. Otherwise an assistant message shows the
    /// artifacts created within the association window after it.
    pub fn artifacts_for_message(&self, id: &str) -> Vec<ArtifactRef> {
        let Some(message) = self.state.message(id) else {
            return Vec::new();
        };
        if !message.artifact_refs.is_empty() {
            return message.artifact_refs.clone();
        }
        if !message.artifact_types.is_empty() {
            return self
                .state
                .artifacts
                .iter()
                .filter(|a| message.artifact_types.contains(&a.artifact_type))
                .cloned()
                .collect();
        }
        if message.role != Role::Assistant {
            return Vec::new();
        }

        let window =
            TimeDelta::from_std(self.config.association_window()).unwrap_or(TimeDelta::zero());
        let start = message.timestamp;
        let end = start + window;
        self.state
            .artifacts
            .iter()
            .filter(|a| a.created_at >= start && a.created_at <= end)
            .cloned()
            .collect()
    }
}
