//! Client engine for Parley conversations.
//!
//! A [`Reconciler`] folds stream events into a per-session [`SessionState`].
//! [`SessionRecovery`] decides whether a conversation starts fresh or is
//! replayed from history. [`SessionDriver`] runs one reconciler on its own
//! task, and [`GatewayClient`] talks to the gateway over HTTP.

pub mod client;
pub mod config;
pub mod driver;
pub mod reconciler;
pub mod recovery;
pub mod retry;
pub mod state;

pub use client::{ClientError, ClientResult, EventStream, GatewayClient};
pub use config::ReconcilerConfig;
pub use driver::{DriverClosed, DriverInput, LocalCommand, SessionDriver, SessionHandle};
pub use reconciler::{Effect, Reconciler};
pub use recovery::{
    HistorySource, RecoveryOutcome, RecoveryPhase, RecoveryStep, SessionRecovery,
    displayable_history,
};
pub use retry::{restore_session_reference, retry_with_backoff};
pub use state::{Session, SessionState, SessionStatus};
