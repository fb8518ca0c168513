//! LLM integration — intent classification for the conversation core.
//!
//! Uses the rig-core crate for HTTP transport. The core only ever sees the
//! categorical [`Classification`]; prompts and parsing stay in this module.

pub mod reasoning;

pub use reasoning::{RigReasoningAgent, parse_classification};

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::flow::Intent;
use crate::session::{HistoryEntry, Stage};

/// Configuration for creating a reasoning agent.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Categorical reading of the latest user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    /// Optional free-text reply for messages the flow has no text for.
    pub reply: Option<String>,
}

impl Classification {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// External reasoning collaborator.
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Classify the last user entry of `history` given the current stage.
    async fn classify(
        &self,
        stage: Stage,
        history: &[HistoryEntry],
    ) -> Result<Classification, CollaboratorError>;
}
