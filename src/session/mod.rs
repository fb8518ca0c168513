//! Session store — durable, versioned conversation state keyed by user.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod store;

pub use libsql_backend::LibSqlSessionStore;
pub use model::{HistoryEntry, Role, Session, Stage};
pub use store::SessionStore;
