//! Runs one reconciler on its own task.
//!
//! The driver task is the only owner of the reconciler and of its
//! [`SessionRecovery`], so no locks are involved. Stream events, local edits,
//! recovery results and timer ticks arrive on one channel and are applied in
//! order; every change is published as a snapshot on a `watch` channel.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parley_protocol::{ApprovalRequest, HistoryResponse, Message, MessageAttachment, StreamEvent};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::client::ClientError;
use crate::reconciler::{Effect, Reconciler};
use crate::recovery::{HistorySource, RecoveryOutcome, RecoveryStep, SessionRecovery};
use crate::state::SessionState;

const INPUT_CAPACITY: usize = 256;

/// The driver task has stopped.
#[derive(Debug, Error)]
#[error("session driver is no longer running")]
pub struct DriverClosed;

/// Local operations on the transcript.
pub enum LocalCommand {
    PushUserMessage {
        text: String,
        attachments: Vec<MessageAttachment>,
        reply: oneshot::Sender<Message>,
    },
    EditMessage {
        id: String,
        text: String,
    },
    TruncateAfter {
        id: String,
    },
    RerunPhase {
        phase: String,
    },
    ResolveApproval {
        reply: oneshot::Sender<Option<ApprovalRequest>>,
    },
    /// Start recovery for the current subject. The reply is `None` when the
    /// subject changed before the history arrived.
    Recover {
        persisted: Option<String>,
        source: Arc<dyn HistorySource>,
        reply: oneshot::Sender<Option<RecoveryOutcome>>,
    },
    /// Move to another workflow subject, discarding the current transcript.
    SwitchSubject {
        subject_id: Option<String>,
    },
}

/// Input of the driver task.
pub enum DriverInput {
    Stream(StreamEvent),
    Local(LocalCommand),
    /// A held progress indicator is due to be cleared.
    ClearProgress(u64),
    /// A history fetch started by [`LocalCommand::Recover`] finished.
    HistoryLoaded {
        generation: u64,
        session_id: String,
        result: Result<Option<HistoryResponse>, ClientError>,
        reply: oneshot::Sender<Option<RecoveryOutcome>>,
    },
}

/// Owner of a reconciler, run on a dedicated task.
pub struct SessionDriver {
    reconciler: Reconciler,
    recovery: SessionRecovery,
    rx: mpsc::Receiver<DriverInput>,
    /// Used by timers and history fetches; does not keep the driver alive.
    loopback: mpsc::WeakSender<DriverInput>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionDriver {
    /// Start a driver task for `reconciler`.
    ///
    /// Recovery starts out for the subject of the reconciler's session. The
    /// task ends once every [`SessionHandle`] is dropped and hands the
    /// reconciler back through the join handle.
    pub fn spawn(reconciler: Reconciler) -> (SessionHandle, JoinHandle<Reconciler>) {
        let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(reconciler.state().clone());
        let recovery = SessionRecovery::new(reconciler.state().session.subject_id.clone());
        let driver = Self {
            reconciler,
            recovery,
            rx,
            loopback: tx.downgrade(),
            state_tx,
        };
        let task = tokio::spawn(driver.run());
        (
            SessionHandle {
                tx,
                state: state_rx,
            },
            task,
        )
    }

    async fn run(mut self) -> Reconciler {
        while let Some(input) = self.rx.recv().await {
            let effects = self.handle(input);
            for effect in effects {
                self.schedule(effect);
            }
            self.state_tx.send_replace(self.reconciler.state().clone());
        }
        debug!(
            "session driver for {} stopped",
            self.reconciler.state().session.id
        );
        self.reconciler
    }

    fn handle(&mut self, input: DriverInput) -> Vec<Effect> {
        match input {
            DriverInput::Stream(event) => return self.reconciler.apply(event),
            DriverInput::ClearProgress(generation) => {
                self.reconciler.clear_progress(generation);
            }
            DriverInput::Local(command) => self.handle_local(command),
            DriverInput::HistoryLoaded {
                generation,
                session_id,
                result,
                reply,
            } => {
                let outcome =
                    self.recovery
                        .complete(generation, &session_id, result, &mut self.reconciler);
                let _ = reply.send(outcome);
            }
        }
        Vec::new()
    }

    fn handle_local(&mut self, command: LocalCommand) {
        let reconciler = &mut self.reconciler;
        match command {
            LocalCommand::PushUserMessage {
                text,
                attachments,
                reply,
            } => {
                let message = reconciler.push_user_message(text, attachments);
                let _ = reply.send(message);
            }
            LocalCommand::EditMessage { id, text } => {
                if !reconciler.edit_message(&id, text) {
                    debug!("edit for unknown message {}", id);
                }
            }
            LocalCommand::TruncateAfter { id } => {
                if !reconciler.truncate_after(&id) {
                    debug!("truncate after unknown message {}", id);
                }
            }
            LocalCommand::RerunPhase { phase } => reconciler.rerun_phase(phase),
            LocalCommand::ResolveApproval { reply } => {
                let _ = reply.send(reconciler.resolve_approval());
            }
            LocalCommand::Recover {
                persisted,
                source,
                reply,
            } => self.begin_recovery(persisted.as_deref(), source, reply),
            LocalCommand::SwitchSubject { subject_id } => {
                self.recovery.switch_subject(subject_id, reconciler);
            }
        }
    }

    fn begin_recovery(
        &mut self,
        persisted: Option<&str>,
        source: Arc<dyn HistorySource>,
        reply: oneshot::Sender<Option<RecoveryOutcome>>,
    ) {
        match self.recovery.begin(persisted, &self.reconciler) {
            RecoveryStep::Done(outcome) => {
                let _ = reply.send(Some(outcome));
            }
            RecoveryStep::Skip => {
                let _ = reply.send(Some(self.recovery.skipped()));
            }
            RecoveryStep::Fetch {
                generation,
                session_id,
            } => {
                info!("loading history for session {}", session_id);
                let loopback = self.loopback.clone();
                tokio::spawn(async move {
                    let result = source.fetch_history(&session_id).await;
                    if let Some(tx) = loopback.upgrade() {
                        let _ = tx
                            .send(DriverInput::HistoryLoaded {
                                generation,
                                session_id,
                                result,
                                reply,
                            })
                            .await;
                    }
                });
            }
        }
    }

    fn schedule(&self, effect: Effect) {
        match effect {
            Effect::ScheduleProgressClear { generation, after } => {
                let loopback = self.loopback.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(tx) = loopback.upgrade() {
                        let _ = tx.send(DriverInput::ClearProgress(generation)).await;
                    }
                });
            }
        }
    }
}

/// Handle to a running [`SessionDriver`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<DriverInput>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Latest published state.
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub async fn apply(&self, event: StreamEvent) -> Result<(), DriverClosed> {
        self.send(DriverInput::Stream(event)).await
    }

    pub async fn command(&self, command: LocalCommand) -> Result<(), DriverClosed> {
        self.send(DriverInput::Local(command)).await
    }

    pub async fn push_user_message(
        &self,
        text: impl Into<String>,
        attachments: Vec<MessageAttachment>,
    ) -> Result<Message, DriverClosed> {
        let (reply, rx) = oneshot::channel();
        self.command(LocalCommand::PushUserMessage {
            text: text.into(),
            attachments,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DriverClosed)
    }

    pub async fn resolve_approval(&self) -> Result<Option<ApprovalRequest>, DriverClosed> {
        let (reply, rx) = oneshot::channel();
        self.command(LocalCommand::ResolveApproval { reply }).await?;
        rx.await.map_err(|_| DriverClosed)
    }

    /// Recover the conversation from `source`.
    ///
    /// Stream events keep being applied while the history is fetched.
    /// Resolves to `None` when the subject changed in the meantime.
    pub async fn recover(
        &self,
        persisted: Option<String>,
        source: Arc<dyn HistorySource>,
    ) -> Result<Option<RecoveryOutcome>, DriverClosed> {
        let (reply, rx) = oneshot::channel();
        self.command(LocalCommand::Recover {
            persisted,
            source,
            reply,
        })
        .await?;
        rx.await.map_err(|_| DriverClosed)
    }

    pub async fn switch_subject(&self, subject_id: Option<String>) -> Result<(), DriverClosed> {
        self.command(LocalCommand::SwitchSubject { subject_id })
            .await
    }

    /// Feed a decoded event stream into the driver until it ends.
    ///
    /// A transport failure is applied as an `error` event, and so is a
    /// stream that closes before `done` or `error` arrived.
    pub fn attach<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: Stream<Item = Result<StreamEvent, ClientError>> + Send + Unpin + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(event) => event,
                    Err(err) => {
                        warn!("event stream failed: {}", err);
                        StreamEvent::error("stream_interrupted", err.to_string())
                    }
                };
                let terminal = matches!(event, StreamEvent::Error { .. } | StreamEvent::Done);
                if handle.apply(event).await.is_err() || terminal {
                    return;
                }
            }

            warn!("event stream closed before the run finished");
            let _ = handle
                .apply(StreamEvent::error(
                    "stream_closed",
                    "The connection to the gateway closed before the reply finished.",
                ))
                .await;
        })
    }

    async fn send(&self, input: DriverInput) -> Result<(), DriverClosed> {
        self.tx.send(input).await.map_err(|_| DriverClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilerConfig;
    use crate::state::{Session, SessionStatus};
    use async_trait::async_trait;
    use parley_protocol::{PipelineProgress, ProgressStatus};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn spawn_driver(config: ReconcilerConfig) -> (SessionHandle, JoinHandle<Reconciler>) {
        SessionDriver::spawn(Reconciler::new(
            Session::new(Some("subj-1".into())),
            config,
        ))
    }

    async fn wait_for(
        handle: &SessionHandle,
        check: impl FnMut(&SessionState) -> bool,
    ) -> SessionState {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(check))
            .await
            .expect("state never matched")
            .expect("driver stopped")
            .clone()
    }

    /// History that is held back until released.
    struct GatedHistory {
        started: Notify,
        release: Notify,
        messages: Vec<Message>,
    }

    impl GatedHistory {
        fn new(messages: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                started: Notify::new(),
                release: Notify::new(),
                messages,
            })
        }
    }

    #[async_trait]
    impl HistorySource for GatedHistory {
        async fn fetch_history(
            &self,
            session_id: &str,
        ) -> Result<Option<HistoryResponse>, ClientError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Some(HistoryResponse {
                session_id: session_id.to_string(),
                subject_id: None,
                messages: self.messages.clone(),
                phase: Some("review".into()),
            }))
        }
    }

    #[tokio::test]
    async fn test_events_are_applied_in_order() {
        let (handle, _task) = spawn_driver(ReconcilerConfig::default());
        let user = handle.push_user_message("Hello", Vec::new()).await.unwrap();
        for text in ["Hel", "lo", " world"] {
            handle
                .apply(StreamEvent::Token { text: text.into() })
                .await
                .unwrap();
        }
        handle.apply(StreamEvent::MessageDone).await.unwrap();
        handle.apply(StreamEvent::Done).await.unwrap();

        let state = wait_for(&handle, |s| s.messages.len() == 2 && !s.session.streaming).await;
        assert_eq!(state.messages[0].id, user.id);
        assert_eq!(state.messages[1].content, "Hello world");
        assert_eq!(state.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_progress_is_cleared_after_hold() {
        let config = ReconcilerConfig {
            progress_hold_ms: 20,
            ..ReconcilerConfig::default()
        };
        let (handle, _task) = spawn_driver(config);
        handle
            .apply(StreamEvent::PipelineProgress(PipelineProgress {
                step: "artifacts".into(),
                label: "Generating artifacts".into(),
                status: ProgressStatus::Completed,
                current: 2,
                total: 2,
                step_index: 6,
                total_steps: 7,
                overall_pct: 100.0,
            }))
            .await
            .unwrap();

        let state = wait_for(&handle, |s| s.progress.is_none() && !s.messages.is_empty()).await;
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].artifact_types, vec!["erd", "data_quality"]);
    }

    #[tokio::test]
    async fn test_stream_failure_becomes_error_message() {
        let (handle, _task) = spawn_driver(ReconcilerConfig::default());
        let events = futures::stream::iter(vec![
            Ok(StreamEvent::Token { text: "part".into() }),
            Err(ClientError::Status {
                status: 502,
                message: "gone".into(),
            }),
        ]);
        handle.attach(events).await.unwrap();

        let state = wait_for(&handle, |s| s.status == SessionStatus::Error).await;
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_closed_before_done_ends_the_run() {
        let (handle, _task) = spawn_driver(ReconcilerConfig::default());
        let events = futures::stream::iter(vec![Ok(StreamEvent::Token {
            text: "partial".into(),
        })]);
        handle.attach(events).await.unwrap();

        let state = wait_for(&handle, |s| s.status == SessionStatus::Error).await;
        assert!(!state.session.streaming);
        assert!(state.streaming_message().is_none());
        assert_eq!(state.messages[0].content, "partial");
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_ending_with_done_adds_nothing() {
        let (handle, _task) = spawn_driver(ReconcilerConfig::default());
        let events = futures::stream::iter(vec![
            Ok(StreamEvent::Token { text: "all".into() }),
            Ok(StreamEvent::MessageDone),
            Ok(StreamEvent::Done),
        ]);
        handle.attach(events).await.unwrap();
        // Processed after everything the stream applied.
        handle.resolve_approval().await.unwrap();

        let state = handle.snapshot();
        assert_eq!(state.status, SessionStatus::Idle);
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_runs_inside_driver() {
        let (handle, _task) = spawn_driver(ReconcilerConfig::default());
        let source = GatedHistory::new(vec![Message::user("hi"), Message::assistant("hello")]);

        let pending = tokio::spawn({
            let handle = handle.clone();
            let source = source.clone();
            async move { handle.recover(Some("s1".into()), source).await }
        });
        source.started.notified().await;

        // The driver keeps applying events while the history is in flight.
        handle
            .apply(StreamEvent::Token { text: "live".into() })
            .await
            .unwrap();
        wait_for(&handle, |s| s.messages.len() == 1).await;

        source.release.notify_one();
        let outcome = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.replayed, 2);
        assert!(!outcome.auto_trigger_allowed);

        let state = wait_for(&handle, |s| s.session.id == "s1").await;
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.session.phase.as_deref(), Some("review"));

        let again = handle
            .recover(Some("s1".into()), source.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.replayed, 0);
    }

    #[tokio::test]
    async fn test_subject_switch_discards_history_in_flight() {
        let (handle, _task) = spawn_driver(ReconcilerConfig::default());
        let source = GatedHistory::new(vec![Message::assistant("old subject")]);

        let pending = tokio::spawn({
            let handle = handle.clone();
            let source = source.clone();
            async move { handle.recover(Some("s1".into()), source).await }
        });
        source.started.notified().await;

        handle.switch_subject(Some("subj-2".into())).await.unwrap();
        source.release.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), None);
        let state = handle.snapshot();
        assert_eq!(state.session.subject_id.as_deref(), Some("subj-2"));
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn test_driver_returns_reconciler_when_handles_drop() {
        let (handle, task) = spawn_driver(ReconcilerConfig::default());
        handle
            .apply(StreamEvent::Token { text: "hi".into() })
            .await
            .unwrap();
        drop(handle);

        let reconciler = task.await.unwrap();
        assert_eq!(reconciler.state().messages.len(), 1);
    }
}
