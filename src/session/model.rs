//! Per-user conversation state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stages of the application process.
///
/// Progresses linearly: Greeting → AwaitingDocuments →
/// AwaitingDocumentConfirmation → AwaitingPriceAcceptance → PolicyIssued.
/// A rejection of extracted data steps back to AwaitingDocuments; an
/// explicit restart returns to Greeting from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Greeting,
    AwaitingDocuments,
    AwaitingDocumentConfirmation,
    AwaitingPriceAcceptance,
    PolicyIssued,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Greeting,
        Stage::AwaitingDocuments,
        Stage::AwaitingDocumentConfirmation,
        Stage::AwaitingPriceAcceptance,
        Stage::PolicyIssued,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::AwaitingDocuments => "awaiting_documents",
            Self::AwaitingDocumentConfirmation => "awaiting_document_confirmation",
            Self::AwaitingPriceAcceptance => "awaiting_price_acceptance",
            Self::PolicyIssued => "policy_issued",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One line of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Durable conversation state for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub stage: Stage,
    /// Oldest first.
    pub history: Vec<HistoryEntry>,
    pub extracted_fields: BTreeMap<String, String>,
    /// Version of the stored row this value was read from.
    pub version: i64,
}

impl Session {
    /// A fresh Greeting-stage session that has never been stored.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            stage: Stage::Greeting,
            history: Vec::new(),
            extracted_fields: BTreeMap::new(),
            version: 0,
        }
    }

    /// Append to history, evicting the oldest entries beyond `max`.
    pub fn push_history(&mut self, entry: HistoryEntry, max: usize) {
        self.history.push(entry);
        self.truncate_history(max);
    }

    /// Keep only the most recent `max` entries.
    pub fn truncate_history(&mut self, max: usize) {
        if self.history.len() > max {
            let excess = self.history.len() - max;
            self.history.drain(..excess);
        }
    }

    /// Start over: back to Greeting with no extracted data. History is kept
    /// for audit.
    pub fn reset(&mut self) {
        self.stage = Stage::Greeting;
        self.extracted_fields.clear();
    }
}
