//! Stage router — pure (stage, event) → (action, next stage) table.
//!
//! The router never sees raw text. Free-text classification happens in the
//! reasoning agent; only its categorical [`Intent`] reaches this table.

use serde::{Deserialize, Serialize};

use crate::session::Stage;

/// Categorical reading of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Wants to start the application.
    Proceed,
    /// Extracted data is correct.
    Confirm,
    /// Extracted data is wrong.
    Reject,
    /// Accepts the quoted price.
    Accept,
    /// Haggles over the price.
    Negotiate,
    /// Wants to start over.
    Restart,
    /// Anything else.
    Unrecognized,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::Proceed,
        Intent::Confirm,
        Intent::Reject,
        Intent::Accept,
        Intent::Negotiate,
        Intent::Restart,
        Intent::Unrecognized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Confirm => "confirm",
            Self::Reject => "reject",
            Self::Accept => "accept",
            Self::Negotiate => "negotiate",
            Self::Restart => "restart",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the router understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    Intent(Intent),
    /// The upload aggregator flushed a batch for this user.
    BatchFlushed,
}

/// Side effect the orchestrator must carry out before moving on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Ask for the documents.
    RequestDocuments,
    /// Run the document extractor on the flushed batch.
    ExtractDocuments,
    /// Quote the fixed price.
    QuotePrice,
    /// Drop extracted fields and ask for new uploads.
    ClearFields,
    /// Generate and deliver the policy.
    DeliverPolicy,
    /// Repeat that the price is fixed.
    ReassertPrice,
    /// Clear fields, discard any pending batch, greet again.
    Restart,
    /// Stage unchanged; repeat what is expected next.
    RestateExpectation,
    /// Stage unchanged; nothing to say (redelivered batch).
    Ignore,
}

/// Outcome of routing one event.
///
/// `next` is the stage on success. When the action fails the session keeps
/// its current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub next: Stage,
}

impl Transition {
    fn to(action: Action, next: Stage) -> Self {
        Self { action, next }
    }

    fn stay(action: Action, stage: Stage) -> Self {
        Self { action, next: stage }
    }

    /// Whether a successful action moves the session.
    pub fn advances_from(&self, stage: Stage) -> bool {
        self.next != stage
    }
}

/// Look up the transition for `event` in `stage`.
pub fn route(stage: Stage, event: FlowEvent) -> Transition {
    use Intent::*;
    use Stage::*;

    match (stage, event) {
        (_, FlowEvent::Intent(Restart)) => Transition::to(Action::Restart, Greeting),

        (Greeting, FlowEvent::Intent(Proceed)) => {
            Transition::to(Action::RequestDocuments, AwaitingDocuments)
        }

        (AwaitingDocuments, FlowEvent::BatchFlushed) => {
            Transition::to(Action::ExtractDocuments, AwaitingDocumentConfirmation)
        }

        (AwaitingDocumentConfirmation, FlowEvent::Intent(Confirm)) => {
            Transition::to(Action::QuotePrice, AwaitingPriceAcceptance)
        }
        (AwaitingDocumentConfirmation, FlowEvent::Intent(Reject)) => {
            Transition::to(Action::ClearFields, AwaitingDocuments)
        }

        (AwaitingPriceAcceptance, FlowEvent::Intent(Accept)) => {
            Transition::to(Action::DeliverPolicy, PolicyIssued)
        }
        (AwaitingPriceAcceptance, FlowEvent::Intent(Negotiate)) => {
            Transition::stay(Action::ReassertPrice, AwaitingPriceAcceptance)
        }

        // A batch arriving after a successful extraction is a redelivery.
        (AwaitingDocumentConfirmation, FlowEvent::BatchFlushed) => {
            Transition::stay(Action::Ignore, AwaitingDocumentConfirmation)
        }
        (stage, FlowEvent::BatchFlushed) => Transition::stay(Action::RestateExpectation, stage),
        (stage, FlowEvent::Intent(_)) => Transition::stay(Action::RestateExpectation, stage),
    }
}

/// Replay events from Greeting assuming every action succeeds.
pub fn replay(events: impl IntoIterator<Item = FlowEvent>) -> Stage {
    events
        .into_iter()
        .fold(Stage::Greeting, |stage, event| route(stage, event).next)
}
