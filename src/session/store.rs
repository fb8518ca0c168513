//! `SessionStore` trait — durable, versioned per-user sessions.

use async_trait::async_trait;

use crate::error::DatabaseError;

use super::model::{HistoryEntry, Session};

/// Backend-agnostic session persistence with optimistic concurrency.
///
/// Every successful write bumps the row's `version` by one. Writers pass the
/// session they read; if the stored version has moved on, the write fails
/// with [`DatabaseError::ConcurrencyConflict`] and nothing is changed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session for `user_id`. A user that has never been seen gets
    /// a fresh Greeting-stage session at version 0; its row is created by
    /// the first `save`.
    async fn get(&self, user_id: &str) -> Result<Session, DatabaseError>;

    /// Persist `session` if the stored version still equals
    /// `session.version`. Returns the new version.
    async fn save(&self, session: &Session) -> Result<i64, DatabaseError>;

    /// Read, append one bounded history entry, and write back atomically.
    async fn append_history(
        &self,
        user_id: &str,
        entry: HistoryEntry,
    ) -> Result<Session, DatabaseError>;

    /// Start over: Greeting stage, no extracted fields, history preserved.
    async fn reset(&self, user_id: &str) -> Result<Session, DatabaseError>;
}
