//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::dispatch::CommandDispatcher;
use crate::history::HistoryStore;
use crate::relay::Relay;
use crate::upstream::{UpstreamClient, UpstreamResult};

/// Application state shared across all handlers.
///
/// Nothing here is mutable per session: every relay owns its own upstream
/// connection, so instances can be scaled horizontally.
#[derive(Clone)]
pub struct AppState {
    /// Opens one upstream stream per downstream connection.
    pub relay: Relay,
    /// Forwards send/retry/interrupt commands.
    pub dispatcher: CommandDispatcher,
    /// Two-tier history reads.
    pub history: HistoryStore,
    /// Header carrying the caller identity.
    pub identity_header: Arc<str>,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Arc<[String]>,
}

impl AppState {
    pub fn new(config: &AppConfig, history: HistoryStore) -> UpstreamResult<Self> {
        let upstream = UpstreamClient::new(&config.upstream)?;
        Ok(Self {
            relay: Relay::new(upstream.clone(), &config.relay),
            dispatcher: CommandDispatcher::new(upstream),
            history,
            identity_header: Arc::from(config.upstream.identity_header.as_str()),
            cors_origins: Arc::from(config.server.cors_origins.clone()),
        })
    }
}
