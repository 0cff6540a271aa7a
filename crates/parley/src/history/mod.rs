//! Session history: a fast cache tier in front of durable subject aggregates.

mod cache;
mod repository;
mod service;

use thiserror::Error;

pub use cache::{CacheError, CachedHistory, MemoryCache, MessageCache};
pub use repository::{SubjectRecord, SubjectRepository};
pub use service::{HistoryRecord, HistoryStore};

/// Errors from the durable history tier.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt history: {0}")]
    Corrupt(String),
}
