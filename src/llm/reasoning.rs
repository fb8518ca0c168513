//! Reasoning agent backed by rig-core.
//!
//! Builds a stage-specific preamble, sends the recent transcript, and parses
//! a `{"intent": ..., "reply": ...}` object out of the model's answer.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::error::CollaboratorError;
use crate::flow::Intent;
use crate::flow::prompts::classification_instructions;
use crate::session::{HistoryEntry, Role, Stage};

use super::{Classification, LlmConfig, ReasoningAgent};

const SERVICE: &str = "reasoning";

/// Transcript entries sent along with each classification request.
const TRANSCRIPT_WINDOW: usize = 20;

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

type OpenAiClient = rig::client::Client<rig::providers::openai::client::OpenAIResponsesExt>;

/// `ReasoningAgent` talking to an OpenAI model through rig-core.
pub struct RigReasoningAgent {
    client: OpenAiClient,
    model: String,
}

impl RigReasoningAgent {
    pub fn new(config: &LlmConfig) -> Result<Self, CollaboratorError> {
        let client = rig::providers::openai::Client::new(config.api_key.expose_secret())
            .map_err(|e| {
                CollaboratorError::rejected(SERVICE, format!("Failed to create OpenAI client: {e}"))
            })?;
        tracing::info!(model = %config.model, "Reasoning agent ready");
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, preamble: &str, prompt: String) -> Result<String, CollaboratorError> {
        self.client
            .agent(&self.model)
            .preamble(preamble)
            .temperature(0.0)
            .build()
            .prompt(prompt)
            .await
            .map_err(|e| CollaboratorError::transient(SERVICE, e))
    }
}

#[async_trait]
impl ReasoningAgent for RigReasoningAgent {
    async fn classify(
        &self,
        stage: Stage,
        history: &[HistoryEntry],
    ) -> Result<Classification, CollaboratorError> {
        let preamble = classification_instructions(stage);
        let prompt = render_transcript(history);
        let raw = self.complete(&preamble, prompt).await?;
        let classification =
            parse_classification(&raw).map_err(|e| CollaboratorError::rejected(SERVICE, e))?;
        tracing::debug!(%stage, intent = %classification.intent, "Message classified");
        Ok(classification)
    }
}

/// Format the tail of the history as a plain transcript.
fn render_transcript(history: &[HistoryEntry]) -> String {
    let start = history.len().saturating_sub(TRANSCRIPT_WINDOW);
    let mut lines: Vec<String> = history[start..]
        .iter()
        .map(|entry| {
            let who = match entry.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            format!("{who}: {}", entry.content)
        })
        .collect();
    lines.push(String::new());
    lines.push("Classify the last User message.".to_string());
    lines.join("\n")
}

#[derive(Deserialize)]
struct RawClassification {
    intent: String,
    #[serde(default)]
    reply: Option<String>,
}

/// Parse the model's answer. Unknown intent names map to `Unrecognized`.
pub fn parse_classification(raw: &str) -> Result<Classification, String> {
    let json = JSON_OBJECT
        .find(raw)
        .map(|m| m.as_str())
        .ok_or_else(|| "no JSON object in model output".to_string())?;
    let parsed: RawClassification =
        serde_json::from_str(json).map_err(|e| format!("invalid classification JSON: {e}"))?;

    let wanted = parsed.intent.trim().to_lowercase();
    let intent = Intent::ALL
        .into_iter()
        .find(|i| i.as_str() == wanted)
        .unwrap_or(Intent::Unrecognized);

    let reply = parsed
        .reply
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());

    Ok(Classification { intent, reply })
}
