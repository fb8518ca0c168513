//! Application flow — stage routing table and the texts that go with it.

pub mod prompts;
pub mod router;

pub use router::{Action, FlowEvent, Intent, Transition, route};
