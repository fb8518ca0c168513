//! Coverdesk — conversation core for a chat-based car-insurance assistant.

pub mod channels;
pub mod config;
pub mod documents;
pub mod error;
pub mod flow;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod policy;
pub mod retry;
pub mod session;
pub mod upload;
