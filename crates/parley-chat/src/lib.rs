//! parley-chat: conversation state and the turn runtime
//!
//! This crate owns the per-conversation message lists, merges streamed
//! chunks into them, and drives one outbound turn at a time against a
//! [`parley_ai::Generator`].

pub mod chat;
pub mod conversation;
pub mod error;
pub mod history;
pub mod intent;
pub mod persistence;
pub mod sources;
pub mod store;

pub use chat::{Chat, TurnOutcome};
pub use conversation::{Conversation, ConversationId, ConversationSummary};
pub use error::{Error, Result};
pub use history::build_history;
pub use intent::{Route, classify};
pub use persistence::{MemoryPersistence, Persistence, PersistenceWriter, StoredMessage};
pub use sources::{SourceSet, dedup_sources};
pub use store::{Appended, ConversationStore, ConversationTable};
