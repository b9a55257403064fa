//! Durable conversation store.
//!
//! SQLite-backed CRUD for conversations, turns, messages, payloads, tool
//! call records, elicitations, and schedules. Writes that touch a turn are
//! transactional; reads inside one call see a single snapshot. Payloads
//! are content-addressed by SHA-256 and immutable once written.

pub mod migrations;
pub mod redact;
mod store;

pub use redact::Redactor;
pub use store::{ConversationStore, NewMessage};
