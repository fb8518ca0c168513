//! Orchestrator — turns inbound events into session transitions.
//!
//! For every event of a user: take the user's lock, load the session, ask
//! the router what to do, carry out the action through the collaborators,
//! persist, and hand back the reply. A session only moves once its side
//! effect has succeeded; failures keep the stage and produce an apology.

pub mod locks;
pub mod runtime;

pub use locks::UserLocks;
pub use runtime::Runtime;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channels::{InboundEvent, InboundKind, OutgoingMessage};
use crate::config::OrchestratorConfig;
use crate::documents::DocumentExtractor;
use crate::error::{CollaboratorError, DatabaseError, ExtractionFailure, OrchestratorError};
use crate::flow::prompts;
use crate::flow::{Action, FlowEvent, Intent, Transition, route};
use crate::llm::{Classification, ReasoningAgent};
use crate::policy::{PolicyDelivery, PolicyDocument};
use crate::retry::{RetryPolicy, with_retry};
use crate::session::{HistoryEntry, Session, SessionStore, Stage};
use crate::upload::{FlushedBatch, UploadAggregator};

/// External services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub reasoning: Arc<dyn ReasoningAgent>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub delivery: Arc<dyn PolicyDelivery>,
}

/// Change to the extracted fields carried by an outcome.
#[derive(Debug, Clone)]
enum FieldsChange {
    Keep,
    Replace(BTreeMap<String, String>),
    Clear,
}

/// Result of carrying out one action, not yet persisted.
#[derive(Debug, Clone)]
struct Outcome {
    stage: Stage,
    fields: FieldsChange,
    reply: Option<String>,
}

impl Outcome {
    fn hold(stage: Stage, reply: impl Into<String>) -> Self {
        Self {
            stage,
            fields: FieldsChange::Keep,
            reply: Some(reply.into()),
        }
    }

    fn advance(stage: Stage, fields: FieldsChange, reply: impl Into<String>) -> Self {
        Self {
            stage,
            fields,
            reply: Some(reply.into()),
        }
    }
}

/// Conversation core.
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    aggregator: Arc<UploadAggregator>,
    collaborators: Collaborators,
    locks: UserLocks,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        aggregator: Arc<UploadAggregator>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            aggregator,
            collaborators,
            locks: UserLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drop per-user locks that are no longer in use.
    pub async fn prune_idle_locks(&self) -> usize {
        self.locks.prune().await
    }

    /// Handle one inbound event. Attachments are only buffered; text and
    /// commands are routed and answered.
    pub async fn handle_event(
        &self,
        event: InboundEvent,
    ) -> Result<Option<OutgoingMessage>, OrchestratorError> {
        let user_id = event.user_id;
        match event.kind {
            InboundKind::Attachment(item) => {
                debug!(user_id = %user_id, file_id = %item.file_id, "Buffering attachment");
                self.aggregator.push(&user_id, item).await;
                Ok(None)
            }
            InboundKind::Command(command) => {
                let _guard = self.locks.acquire(&user_id).await;
                let session = self.store.get(&user_id).await?;
                let entry = HistoryEntry::user(command.as_str());
                let classification = Classification::new(Intent::Restart);
                self.route_intent(session, entry, classification).await
            }
            InboundKind::Text(text) => {
                let _guard = self.locks.acquire(&user_id).await;
                let session = self.store.get(&user_id).await?;
                let entry = HistoryEntry::user(text);

                let mut history = session.history.clone();
                history.push(entry.clone());
                let stage = session.stage;
                let reasoning = self.collaborators.reasoning.clone();
                let classified = with_retry(
                    "reasoning",
                    &self.config.retry,
                    self.config.collaborator_timeout,
                    || reasoning.classify(stage, &history),
                )
                .await;

                match classified {
                    Ok(classification) => self.route_intent(session, entry, classification).await,
                    Err(e) => {
                        warn!(user_id = %user_id, %stage, error = %e, "Reasoning failed, asking user to repeat");
                        let outcome = Outcome::hold(stage, prompts::PLEASE_REPEAT);
                        self.commit(session, vec![entry], outcome).await
                    }
                }
            }
        }
    }

    /// Handle a flushed upload batch.
    pub async fn handle_batch(
        &self,
        batch: FlushedBatch,
    ) -> Result<Option<OutgoingMessage>, OrchestratorError> {
        let user_id = batch.user_id.clone();
        let _guard = self.locks.acquire(&user_id).await;
        let session = self.store.get(&user_id).await?;
        let stage = session.stage;

        let entry = HistoryEntry::system(format!("User uploaded {} file(s)", batch.items.len()));

        let transition = route(stage, FlowEvent::BatchFlushed);
        match transition.action {
            Action::ExtractDocuments => {}
            Action::RestateExpectation => {
                info!(
                    user_id = %user_id,
                    %stage,
                    batch_id = %batch.batch_id,
                    "Upload batch outside document collection"
                );
                let reply =
                    prompts::unexpected_upload(stage, self.config.price, &self.config.currency);
                return self.commit(session, vec![entry], Outcome::hold(stage, reply)).await;
            }
            _ => {
                debug!(
                    user_id = %user_id,
                    %stage,
                    batch_id = %batch.batch_id,
                    "Ignoring redelivered upload batch"
                );
                return Ok(None);
            }
        }

        info!(
            user_id = %user_id,
            batch_id = %batch.batch_id,
            items = batch.items.len(),
            "Extracting documents"
        );
        let extractor = self.collaborators.extractor.clone();
        let extracted = with_retry(
            "document extraction",
            &self.config.retry,
            self.config.collaborator_timeout,
            || extractor.extract(&batch.items),
        )
        .await;

        let outcome = match extracted {
            Ok(fields) => Outcome::advance(
                transition.next,
                FieldsChange::Replace(fields.clone()),
                prompts::extracted_summary(&fields),
            ),
            Err(CollaboratorError::Extraction(failure)) => {
                warn!(user_id = %user_id, %failure, "Documents could not be used");
                Outcome::hold(stage, prompts::extraction_failed(&failure))
            }
            Err(CollaboratorError::Rejected { reason, .. }) => {
                warn!(user_id = %user_id, %reason, "Extractor rejected the documents");
                Outcome::hold(
                    stage,
                    prompts::extraction_failed(&ExtractionFailure::Unreadable(reason)),
                )
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Document extraction unavailable");
                Outcome::hold(stage, prompts::DOCUMENT_SERVICE_DOWN)
            }
        };

        self.commit(session, vec![entry], outcome).await
    }

    async fn route_intent(
        &self,
        session: Session,
        entry: HistoryEntry,
        classification: Classification,
    ) -> Result<Option<OutgoingMessage>, OrchestratorError> {
        let stage = session.stage;
        let transition = route(stage, FlowEvent::Intent(classification.intent));
        debug!(
            user_id = %session.user_id,
            %stage,
            intent = %classification.intent,
            action = ?transition.action,
            "Routed message"
        );
        let outcome = self.perform(&session, transition, &classification).await;
        self.commit(session, vec![entry], outcome).await
    }

    /// Carry out the action of `transition` for a text-driven event.
    async fn perform(
        &self,
        session: &Session,
        transition: Transition,
        classification: &Classification,
    ) -> Outcome {
        let stage = session.stage;
        let (price, currency) = (self.config.price, self.config.currency.as_str());

        match transition.action {
            Action::RequestDocuments => Outcome::advance(
                transition.next,
                FieldsChange::Keep,
                prompts::REQUEST_DOCUMENTS,
            ),
            Action::QuotePrice => Outcome::advance(
                transition.next,
                FieldsChange::Keep,
                prompts::price_quote(price, currency),
            ),
            Action::ClearFields => {
                Outcome::advance(transition.next, FieldsChange::Clear, prompts::REUPLOAD)
            }
            Action::ReassertPrice => Outcome::hold(stage, prompts::NON_NEGOTIABLE),
            Action::Restart => {
                let discarded = self.aggregator.discard(&session.user_id).await;
                info!(user_id = %session.user_id, %stage, discarded, "Session restarted");
                Outcome::advance(transition.next, FieldsChange::Clear, prompts::GREETING)
            }
            Action::DeliverPolicy => self.deliver_policy(session, transition).await,
            Action::RestateExpectation => {
                let expected = prompts::expectation(stage, price, currency);
                let reply = match (&classification.reply, classification.intent) {
                    (Some(text), Intent::Unrecognized) => format!("{text}\n\n{expected}"),
                    _ => expected,
                };
                Outcome::hold(stage, reply)
            }
            // Batch actions never result from a text intent.
            Action::ExtractDocuments | Action::Ignore => Outcome {
                stage,
                fields: FieldsChange::Keep,
                reply: None,
            },
        }
    }

    async fn deliver_policy(&self, session: &Session, transition: Transition) -> Outcome {
        let policy = PolicyDocument::render(
            &session.extracted_fields,
            self.config.price,
            &self.config.currency,
        );
        let retry = RetryPolicy {
            max_retries: self.config.policy_delivery_attempts.saturating_sub(1),
            ..self.config.retry
        };
        let delivery = self.collaborators.delivery.clone();
        let user_id = session.user_id.as_str();

        let delivered = with_retry(
            "policy delivery",
            &retry,
            self.config.collaborator_timeout,
            || delivery.deliver(user_id, &policy),
        )
        .await;

        match delivered {
            Ok(()) => {
                info!(user_id, policy_number = %policy.policy_number, "Policy issued");
                Outcome::advance(transition.next, FieldsChange::Keep, prompts::POLICY_ISSUED)
            }
            Err(e) => {
                warn!(user_id, error = %e, "Policy delivery failed");
                Outcome::hold(session.stage, prompts::POLICY_DELIVERY_FAILED)
            }
        }
    }

    /// Persist `outcome` on top of `base`. On a version conflict the session
    /// is reloaded once; if it is still in the same stage the outcome is
    /// re-applied without repeating side effects, otherwise the user is asked
    /// to try again.
    async fn commit(
        &self,
        base: Session,
        entries: Vec<HistoryEntry>,
        outcome: Outcome,
    ) -> Result<Option<OutgoingMessage>, OrchestratorError> {
        let user_id = base.user_id.clone();
        let from = base.stage;

        let updated = apply(&base, &entries, &outcome, self.config.max_history);
        let saved = match self.store.save(&updated).await {
            Ok(version) => Ok(version),
            Err(e) if e.is_conflict() => {
                warn!(user_id = %user_id, version = base.version, "Session changed underneath, reloading");
                self.retry_commit(&user_id, from, &entries, &outcome).await
            }
            Err(e) => Err(e),
        };

        match saved {
            Ok(version) => {
                if outcome.stage != from {
                    info!(user_id = %user_id, from = %from, to = %outcome.stage, version, "Stage transition");
                }
                Ok(outcome
                    .reply
                    .map(|text| OutgoingMessage::text(user_id, text)))
            }
            Err(e) if e.is_conflict() => {
                warn!(user_id = %user_id, "Giving up after repeated conflicts");
                Ok(Some(OutgoingMessage::text(user_id, prompts::PLEASE_TRY_AGAIN)))
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Session store failure");
                Err(e.into())
            }
        }
    }

    async fn retry_commit(
        &self,
        user_id: &str,
        expected_stage: Stage,
        entries: &[HistoryEntry],
        outcome: &Outcome,
    ) -> Result<i64, DatabaseError> {
        let reloaded = self.store.get(user_id).await?;
        if reloaded.stage != expected_stage {
            return Err(DatabaseError::ConcurrencyConflict {
                user_id: user_id.to_string(),
                expected_version: reloaded.version,
            });
        }
        let updated = apply(&reloaded, entries, outcome, self.config.max_history);
        self.store.save(&updated).await
    }
}

/// Pure application of an outcome to a loaded session.
fn apply(base: &Session, entries: &[HistoryEntry], outcome: &Outcome, max_history: usize) -> Session {
    let mut session = base.clone();
    for entry in entries {
        session.push_history(entry.clone(), max_history);
    }
    if let Some(reply) = &outcome.reply {
        session.push_history(HistoryEntry::assistant(reply.clone()), max_history);
    }
    match &outcome.fields {
        FieldsChange::Keep => {}
        FieldsChange::Replace(fields) => session.extracted_fields = fields.clone(),
        FieldsChange::Clear => session.extracted_fields.clear(),
    }
    session.stage = outcome.stage;
    session
}
