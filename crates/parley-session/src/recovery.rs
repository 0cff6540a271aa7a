//! Decides how a conversation starts: replay stored history or begin fresh.
//!
//! Recovery runs once per workflow subject. It walks
//! `NotStarted -> Recovering -> Hydrated` and always ends hydrated, even when
//! history cannot be loaded. A history response that arrives after the user
//! moved to another subject is discarded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use log::{debug, info, warn};
use parley_protocol::{HistoryResponse, Message};

use crate::client::ClientError;
use crate::reconciler::Reconciler;
use crate::state::Session;

/// Where recovery reads stored history from.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// `Ok(None)` when no tier knows the session.
    async fn fetch_history(&self, session_id: &str)
    -> Result<Option<HistoryResponse>, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPhase {
    #[default]
    NotStarted,
    Recovering,
    Hydrated,
}

/// Result of a recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryOutcome {
    pub hydrated: bool,
    /// Messages replayed into the transcript.
    pub replayed: usize,
    /// Whether the default workflow may start automatically.
    pub auto_trigger_allowed: bool,
}

impl RecoveryOutcome {
    fn fresh() -> Self {
        Self {
            hydrated: true,
            replayed: 0,
            auto_trigger_allowed: true,
        }
    }

    fn existing(replayed: usize) -> Self {
        Self {
            hydrated: true,
            replayed,
            auto_trigger_allowed: false,
        }
    }
}

/// What the caller must do after [`SessionRecovery::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Finished without a network call.
    Done(RecoveryOutcome),
    /// Fetch the history of `session_id` and pass the result to
    /// [`SessionRecovery::complete`] together with `generation`.
    Fetch { generation: u64, session_id: String },
    /// Recovery already ran or is running for this subject.
    Skip,
}

/// Per-subject recovery guard.
#[derive(Debug, Default)]
pub struct SessionRecovery {
    subject_id: Option<String>,
    phase: RecoveryPhase,
    generation: u64,
}

impl SessionRecovery {
    pub fn new(subject_id: Option<String>) -> Self {
        Self {
            subject_id,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    /// Move to another subject: the guard is re-armed and everything the
    /// previous subject left in the reconciler is cleared.
    pub fn switch_subject(&mut self, subject_id: Option<String>, reconciler: &mut Reconciler) {
        if self.subject_id == subject_id {
            return;
        }
        debug!("recovery switching subject {:?} -> {:?}", self.subject_id, subject_id);
        self.subject_id = subject_id.clone();
        self.phase = RecoveryPhase::NotStarted;
        self.generation += 1;
        reconciler.reset(Session::new(subject_id));
    }

    /// Decide how to start, given the session persisted for the subject.
    pub fn begin(&mut self, persisted: Option<&str>, reconciler: &Reconciler) -> RecoveryStep {
        if self.phase != RecoveryPhase::NotStarted {
            return RecoveryStep::Skip;
        }

        let state = reconciler.state();
        match persisted {
            Some(id) if state.session.id == id && !state.messages.is_empty() => {
                debug!("session {} already loaded", id);
                self.phase = RecoveryPhase::Hydrated;
                RecoveryStep::Done(RecoveryOutcome::existing(0))
            }
            None => {
                debug!("no persisted session for subject {:?}", self.subject_id);
                self.phase = RecoveryPhase::Hydrated;
                RecoveryStep::Done(RecoveryOutcome::fresh())
            }
            Some(id) => {
                self.phase = RecoveryPhase::Recovering;
                RecoveryStep::Fetch {
                    generation: self.generation,
                    session_id: id.to_string(),
                }
            }
        }
    }

    /// Apply a history fetch started by [`begin`](Self::begin).
    ///
    /// Returns `None` when the result belongs to an earlier subject.
    pub fn complete(
        &mut self,
        generation: u64,
        session_id: &str,
        result: Result<Option<HistoryResponse>, ClientError>,
        reconciler: &mut Reconciler,
    ) -> Option<RecoveryOutcome> {
        if generation != self.generation || self.phase != RecoveryPhase::Recovering {
            debug!(
                "discarding history for session {} from generation {}",
                session_id, generation
            );
            return None;
        }
        self.phase = RecoveryPhase::Hydrated;

        let history = match result {
            Ok(Some(history)) => history,
            Ok(None) => {
                info!("no stored history for session {}", session_id);
                self.start_empty(session_id, reconciler);
                return Some(RecoveryOutcome::fresh());
            }
            Err(err) => {
                warn!("failed to load history for session {}: {}", session_id, err);
                self.start_empty(session_id, reconciler);
                return Some(RecoveryOutcome {
                    auto_trigger_allowed: false,
                    ..RecoveryOutcome::fresh()
                });
            }
        };

        let messages = displayable_history(history.messages, reconciler.config().history_time_shift());
        if messages.is_empty() {
            self.start_empty(session_id, reconciler);
            return Some(RecoveryOutcome::fresh());
        }

        let replayed = messages.len();
        info!("replaying {} messages for session {}", replayed, session_id);
        reconciler.hydrate(session_id, messages, history.phase);
        Some(RecoveryOutcome::existing(replayed))
    }

    /// Run the whole decision table against `source`.
    pub async fn recover<S>(
        &mut self,
        persisted: Option<&str>,
        reconciler: &mut Reconciler,
        source: &S,
    ) -> RecoveryOutcome
    where
        S: HistorySource + ?Sized,
    {
        match self.begin(persisted, reconciler) {
            RecoveryStep::Done(outcome) => outcome,
            RecoveryStep::Skip => self.skipped(),
            RecoveryStep::Fetch {
                generation,
                session_id,
            } => {
                let result = source.fetch_history(&session_id).await;
                self.complete(generation, &session_id, result, reconciler)
                    .unwrap_or_default()
            }
        }
    }

    /// Outcome reported when [`begin`](Self::begin) returns
    /// [`RecoveryStep::Skip`].
    pub fn skipped(&self) -> RecoveryOutcome {
        RecoveryOutcome {
            hydrated: self.phase == RecoveryPhase::Hydrated,
            replayed: 0,
            auto_trigger_allowed: false,
        }
    }

    fn start_empty(&self, session_id: &str, reconciler: &mut Reconciler) {
        reconciler.reset(Session::with_id(session_id, self.subject_id.clone()));
    }
}

/// Drop control-only messages and move the rest `shift` into the past, so
/// time-window artifact association never links them to fresh artifacts.
pub fn displayable_history(messages: Vec<Message>, shift: Duration) -> Vec<Message> {
    let shift = TimeDelta::from_std(shift).unwrap_or(TimeDelta::zero());
    messages
        .into_iter()
        .filter(|m| !m.is_control())
        .map(|mut m| {
            m.timestamp -= shift;
            m.streaming = false;
            m
        })
        .collect()
}
