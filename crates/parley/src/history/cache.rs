//! Fast history tier.
//!
//! The cache is an optimization, never the source of truth: entries may be
//! missing, expired or written by another process in an older shape.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use parley_protocol::Message;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but the operation failed.
    #[error("cache operation failed: {0}")]
    Backend(String),
}

/// Key/value cache of serialized session histories.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Raw cached value for a session, if any.
    async fn get(&self, session_id: &str) -> Result<Option<Value>, CacheError>;

    /// Store the raw value for a session.
    async fn put(&self, session_id: &str, value: Value) -> Result<(), CacheError>;
}

/// Shapes accepted in the cache: a bare message array, or a wrapper that
/// also names the workflow subject.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CachedHistory {
    Messages(Vec<Message>),
    Wrapped {
        messages: Vec<Message>,
        #[serde(default, alias = "subjectId")]
        subject_id: Option<String>,
        #[serde(default)]
        phase: Option<String>,
    },
}

impl CachedHistory {
    pub fn decode(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Split into `(messages, subject_id, phase)`.
    pub fn into_parts(self) -> (Vec<Message>, Option<String>, Option<String>) {
        match self {
            Self::Messages(messages) => (messages, None, None),
            Self::Wrapped {
                messages,
                subject_id,
                phase,
            } => (messages, subject_id, phase),
        }
    }
}

/// In-process cache with a fixed time-to-live.
///
/// Expired entries are dropped when read, and swept from the whole map on
/// `put` at most once per TTL.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, (Value, Instant)>,
    ttl: Duration,
    last_sweep: Mutex<Instant>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Remove every expired entry.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, stored_at)| stored_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("swept {} expired history cache entries", removed);
        }
    }

    fn sweep_if_due(&self) {
        let due = match self.last_sweep.lock() {
            Ok(mut last) if last.elapsed() >= self.ttl => {
                *last = Instant::now();
                true
            }
            Ok(_) => false,
            Err(_) => true,
        };
        if due {
            self.sweep();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl MessageCache for MemoryCache {
    async fn get(&self, session_id: &str) -> Result<Option<Value>, CacheError> {
        let expired = match self.entries.get(session_id) {
            Some(entry) => {
                let (value, stored_at) = entry.value();
                if stored_at.elapsed() < self.ttl {
                    return Ok(Some(value.clone()));
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(session_id);
        }
        Ok(None)
    }

    async fn put(&self, session_id: &str, value: Value) -> Result<(), CacheError> {
        self.sweep_if_due();
        self.entries
            .insert(session_id.to_string(), (value, Instant::now()));
        Ok(())
    }
}
