//! User-facing texts and reasoning-agent instructions.
//!
//! Every reply the bot sends on its own (as opposed to free text written by
//! the reasoning agent) lives here, so failures can never leak internal
//! error text to the user.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::error::ExtractionFailure;
use crate::session::Stage;

pub const GREETING: &str = "Hello! I'm your car insurance assistant. \
I can issue a car insurance policy for you in a few minutes. \
Would you like to begin the application?";

pub const REQUEST_DOCUMENTS: &str = "Great, let's get started. \
Please send a photo or scan of your passport and of your vehicle identification document. \
You can send them together or one after another.";

pub const DOCUMENTS_RECEIVED_WAIT: &str =
    "Thanks, I'm still waiting for your documents. Please send your passport and vehicle identification document.";

pub const CONFIRM_OR_REJECT: &str =
    "Please reply whether the details above are correct, or tell me what is wrong so you can re-upload the documents.";

pub const REUPLOAD: &str =
    "No problem. Please upload your passport and vehicle identification document again.";

pub const NON_NEGOTIABLE: &str =
    "I understand, but the price is fixed and non-negotiable. Would you like to accept it and receive your policy?";

pub const POLICY_ISSUED: &str =
    "Your insurance policy has been issued and sent to you. Thank you! Send /start if you want to begin a new application.";

pub const ALREADY_ISSUED: &str =
    "Your policy has already been issued. Send /start if you want to begin a new application.";

pub const UPLOAD_BEFORE_START: &str = "Thanks, but I can't use documents yet. \
Tell me you'd like to apply for car insurance first, then send them.";

pub const PLEASE_REPEAT: &str =
    "Sorry, I couldn't process your message just now. Could you please repeat it?";

pub const PLEASE_TRY_AGAIN: &str =
    "Sorry, something went wrong while saving your progress. Please try again.";

pub const DOCUMENT_SERVICE_DOWN: &str =
    "Sorry, I couldn't process your documents right now. Please try uploading them again in a moment.";

pub const POLICY_DELIVERY_FAILED: &str =
    "Sorry, I couldn't issue your policy just now. Please reply again to retry; your application is saved.";

pub fn price_quote(price: Decimal, currency: &str) -> String {
    format!(
        "Thank you for confirming. The price of your car insurance is {price} {currency}. \
Do you accept this price?"
    )
}

pub fn price_reminder(price: Decimal, currency: &str) -> String {
    format!("The price of your car insurance is {price} {currency}. Do you accept this price?")
}

/// Present extracted data and ask the user to confirm it.
pub fn extracted_summary(fields: &BTreeMap<String, String>) -> String {
    let mut lines = vec!["Here is what I extracted from your documents:".to_string()];
    for (name, value) in fields {
        lines.push(format!("• {}: {value}", humanize(name)));
    }
    lines.push(String::new());
    lines.push("Is this information correct?".to_string());
    lines.join("\n")
}

pub fn extraction_failed(failure: &ExtractionFailure) -> String {
    let reason = match failure {
        ExtractionFailure::Unreadable(_) => {
            "I couldn't read your documents clearly.".to_string()
        }
        ExtractionFailure::WrongDocumentType(_) => {
            "These don't look like a passport and a vehicle identification document.".to_string()
        }
        ExtractionFailure::MissingFields(fields) => format!(
            "Some details were missing: {}.",
            fields.iter().map(|f| humanize(f)).collect::<Vec<_>>().join(", ")
        ),
    };
    format!("{reason} Please upload clear photos of your passport and vehicle identification document.")
}

/// What the bot expects next in `stage`.
pub fn expectation(stage: Stage, price: Decimal, currency: &str) -> String {
    match stage {
        Stage::Greeting => GREETING.to_string(),
        Stage::AwaitingDocuments => DOCUMENTS_RECEIVED_WAIT.to_string(),
        Stage::AwaitingDocumentConfirmation => CONFIRM_OR_REJECT.to_string(),
        Stage::AwaitingPriceAcceptance => price_reminder(price, currency),
        Stage::PolicyIssued => ALREADY_ISSUED.to_string(),
    }
}

/// Reply to an upload that arrived when no documents were asked for.
pub fn unexpected_upload(stage: Stage, price: Decimal, currency: &str) -> String {
    match stage {
        Stage::Greeting => UPLOAD_BEFORE_START.to_string(),
        stage => expectation(stage, price, currency),
    }
}

/// Instructions for the reasoning agent in `stage`.
pub fn classification_instructions(stage: Stage) -> String {
    let (role, intents) = match stage {
        Stage::Greeting => (
            "You are the first contact for users interested in car insurance.",
            "- proceed: the user wants to start the application or asks for insurance\n\
             - restart: the user wants to start over",
        ),
        Stage::AwaitingDocuments => (
            "You are waiting for the user to upload their passport and vehicle identification document.",
            "- restart: the user wants to abort or start over",
        ),
        Stage::AwaitingDocumentConfirmation => (
            "You showed the user data extracted from their documents and asked them to confirm it.",
            "- confirm: the user explicitly says the data is correct\n\
             - reject: the user says the data is wrong\n\
             - restart: the user wants to abort or start over",
        ),
        Stage::AwaitingPriceAcceptance => (
            "You quoted a fixed, non-negotiable insurance price.",
            "- accept: the user explicitly accepts the price\n\
             - negotiate: the user asks for a discount, a different price, or declines\n\
             - restart: the user wants to abort or start over",
        ),
        Stage::PolicyIssued => (
            "The user's insurance policy has already been issued.",
            "- restart: the user wants a new application",
        ),
    };

    format!(
        "## Role\n{role}\n\n\
         ## Task\nClassify the user's latest message into exactly one intent:\n{intents}\n\
         - unrecognized: anything else\n\n\
         ## Output\nRespond with a single JSON object and nothing else:\n\
         {{\"intent\": \"<intent>\", \"reply\": \"<optional short reply>\"}}\n\
         Only write a reply for unrecognized messages: a polite one-sentence answer that \
         explains you can only help with car insurance. Never quote prices or invent data."
    )
}

fn humanize(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
