//! libSQL backend — async `SessionStore` implementation.
//!
//! One row per user. Every write is a single conditional statement, so a
//! crash leaves either the full previous row or the full new row.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;

use super::migrations;
use super::model::{HistoryEntry, Session};
use super::store::SessionStore;

/// Attempts for the store's own read-modify-write helpers before giving up
/// on a conflicting writer.
const MUTATE_ATTEMPTS: usize = 3;

const SESSION_COLUMNS: &str = "user_id, stage, extracted_fields, history, version";

/// libSQL session store.
pub struct LibSqlSessionStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    max_history: usize,
}

impl LibSqlSessionStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, max_history: usize) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // PRAGMA journal_mode returns a row, so it goes through query().
        conn.query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            max_history,
        };
        migrations::run_migrations(store.conn()).await?;
        info!(path = %path.display(), "Session store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(max_history: usize) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            max_history,
        };
        migrations::run_migrations(store.conn()).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Read-modify-write with a bounded number of reloads on conflict.
    async fn mutate<F>(&self, user_id: &str, mut apply: F) -> Result<Session, DatabaseError>
    where
        F: FnMut(&mut Session) + Send,
    {
        let mut last_err = None;
        for _ in 0..MUTATE_ATTEMPTS {
            let mut session = self.get(user_id).await?;
            apply(&mut session);
            match self.save(&session).await {
                Ok(version) => {
                    session.version = version;
                    session.truncate_history(self.max_history);
                    return Ok(session);
                }
                Err(e) if e.is_conflict() => {
                    debug!(user_id, "Conflicting write, reloading session");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| DatabaseError::ConcurrencyConflict {
            user_id: user_id.to_string(),
            expected_version: -1,
        }))
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("session row parse: {e}"));

    let user_id: String = row.get(0).map_err(parse)?;
    let stage_str: String = row.get(1).map_err(parse)?;
    let fields_str: String = row.get(2).map_err(parse)?;
    let history_str: String = row.get(3).map_err(parse)?;
    let version: i64 = row.get(4).map_err(parse)?;

    Ok(Session {
        stage: stage_str.parse().map_err(DatabaseError::Serialization)?,
        extracted_fields: serde_json::from_str(&fields_str)
            .map_err(|e| DatabaseError::Serialization(format!("extracted_fields: {e}")))?,
        history: serde_json::from_str(&history_str)
            .map_err(|e| DatabaseError::Serialization(format!("history: {e}")))?,
        user_id,
        version,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlSessionStore {
    async fn get(&self, user_id: &str) -> Result<Session, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_session(&row),
            Ok(None) => {
                debug!(user_id, "No stored session, starting fresh");
                Ok(Session::new(user_id))
            }
            Err(e) => Err(DatabaseError::Query(format!("get_session: {e}"))),
        }
    }

    async fn save(&self, session: &Session) -> Result<i64, DatabaseError> {
        let mut bounded = session.clone();
        bounded.truncate_history(self.max_history);

        let fields_json = serde_json::to_string(&bounded.extracted_fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let history_json = serde_json::to_string(&bounded.history)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let next_version = session.version + 1;

        let affected = if session.version == 0 {
            self.conn()
                .execute(
                    "INSERT INTO sessions (user_id, stage, extracted_fields, history, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT (user_id) DO NOTHING",
                    params![
                        session.user_id.as_str(),
                        session.stage.as_str(),
                        fields_json,
                        history_json,
                        next_version,
                        now
                    ],
                )
                .await
        } else {
            self.conn()
                .execute(
                    "UPDATE sessions
                     SET stage = ?1, extracted_fields = ?2, history = ?3, version = ?4, updated_at = ?5
                     WHERE user_id = ?6 AND version = ?7",
                    params![
                        session.stage.as_str(),
                        fields_json,
                        history_json,
                        next_version,
                        now,
                        session.user_id.as_str(),
                        session.version
                    ],
                )
                .await
        }
        .map_err(|e| DatabaseError::Query(format!("save_session: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::ConcurrencyConflict {
                user_id: session.user_id.clone(),
                expected_version: session.version,
            });
        }

        debug!(
            user_id = %session.user_id,
            stage = %session.stage,
            version = next_version,
            "Session saved"
        );
        Ok(next_version)
    }

    async fn append_history(
        &self,
        user_id: &str,
        entry: HistoryEntry,
    ) -> Result<Session, DatabaseError> {
        let max = self.max_history;
        self.mutate(user_id, |session| session.push_history(entry.clone(), max))
            .await
    }

    async fn reset(&self, user_id: &str) -> Result<Session, DatabaseError> {
        self.mutate(user_id, Session::reset).await
    }
}
