//! Conversation store: the table of conversations and its transitions.
//!
//! The whole table is an immutable snapshot published over a `watch`
//! channel. Every transition clones the current table (a map of `Arc`s),
//! edits the copy and publishes it. Messages touched by a transition are
//! new allocations; untouched ones keep their identity.

use crate::{
    conversation::{Conversation, ConversationId, ConversationSummary},
    error::{Error, Result},
    sources::dedup_sources,
};
use parking_lot::Mutex;
use parley_ai::{ChatMessage, ChatSession, GroundingSource};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// The full table, keyed by conversation id
pub type ConversationTable = HashMap<ConversationId, Arc<Conversation>>;

/// Result of appending a user turn
#[derive(Debug, Clone)]
pub struct Appended {
    pub conversation_id: ConversationId,
    /// Whether the conversation was created by this append
    pub created: bool,
    pub title: String,
    /// The message list as it was before the user message and placeholder
    pub prior: Vec<Arc<ChatMessage>>,
    /// The user message as stored
    pub user_message: Arc<ChatMessage>,
}

/// Owner of all conversations
pub struct ConversationStore {
    /// Serializes transitions; readers go through the watch channel
    writer: Mutex<()>,
    tx: watch::Sender<Arc<ConversationTable>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(ConversationTable::new()));
        Self {
            writer: Mutex::new(()),
            tx,
        }
    }

    /// The current table
    pub fn snapshot(&self) -> Arc<ConversationTable> {
        Arc::clone(&self.tx.borrow())
    }

    /// Subscribe to table snapshots; one is published per transition
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversationTable>> {
        self.tx.subscribe()
    }

    /// Get one conversation
    pub fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.tx.borrow().get(id).cloned()
    }

    /// All conversations, most recently updated first
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut rows: Vec<_> = self.tx.borrow().values().map(|c| c.summary()).collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    /// Apply one transition to a copy of the table and publish it
    fn transition<T>(&self, f: impl FnOnce(&mut ConversationTable) -> Result<T>) -> Result<T> {
        let _guard = self.writer.lock();
        let mut next = ConversationTable::clone(&self.tx.borrow());
        let out = f(&mut next)?;
        self.tx.send_replace(Arc::new(next));
        Ok(out)
    }

    /// Push a user message plus a placeholder reply in one transition.
    ///
    /// With no id a new conversation is created and titled after the message.
    pub fn append(&self, id: Option<&ConversationId>, user_message: ChatMessage) -> Result<Appended> {
        let user_message = Arc::new(user_message);
        self.transition(|table| {
            let (conversation_id, created) = match id {
                Some(id) => (id.clone(), false),
                None => (ConversationId::generate(), true),
            };

            if created {
                let convo = Conversation::new(conversation_id.clone(), &user_message.text());
                table.insert(conversation_id.clone(), Arc::new(convo));
            }

            let entry = table
                .get_mut(&conversation_id)
                .ok_or_else(|| Error::UnknownConversation(conversation_id.clone()))?;
            if entry.streaming {
                return Err(Error::Busy);
            }

            let convo = Arc::make_mut(entry);
            let prior = convo.messages.clone();
            convo.messages.push(Arc::clone(&user_message));
            convo.messages.push(Arc::new(ChatMessage::placeholder()));
            convo.streaming = true;
            convo.updated_at = chrono::Utc::now().timestamp_millis();

            tracing::debug!(
                "Appended turn to {} ({} prior messages, created={})",
                conversation_id,
                prior.len(),
                created
            );

            Ok(Appended {
                conversation_id,
                created,
                title: convo.title.clone(),
                prior,
                user_message: Arc::clone(&user_message),
            })
        })
    }

    /// Replace the in-flight reply with a new model message carrying the
    /// cumulative text and deduplicated sources.
    pub fn stream_update(
        &self,
        id: &ConversationId,
        cumulative_text: &str,
        sources: &[GroundingSource],
    ) -> Result<Arc<ChatMessage>> {
        let message = Arc::new(ChatMessage::model(cumulative_text, dedup_sources(sources)));
        self.transition(|table| {
            let convo = streaming_entry(table, id)?;
            replace_last(convo, Arc::clone(&message));
            Ok(message)
        })
    }

    /// Replace the in-flight reply one last time and close the turn.
    ///
    /// Any later `stream_update` for this turn is rejected.
    pub fn finalize(&self, id: &ConversationId, message: ChatMessage) -> Result<Arc<ChatMessage>> {
        let message = Arc::new(message);
        self.transition(|table| {
            let convo = streaming_entry(table, id)?;
            replace_last(convo, Arc::clone(&message));
            convo.streaming = false;
            convo.updated_at = chrono::Utc::now().timestamp_millis();
            Ok(message)
        })
    }

    /// Close the turn with an error-role message
    pub fn fail(&self, id: &ConversationId, description: impl Into<String>) -> Result<Arc<ChatMessage>> {
        self.finalize(id, ChatMessage::error(description))
    }

    /// Drop every message at or after `index`
    pub fn truncate(&self, id: &ConversationId, index: usize) -> Result<()> {
        self.transition(|table| {
            let entry = table
                .get_mut(id)
                .ok_or_else(|| Error::UnknownConversation(id.clone()))?;
            if entry.streaming {
                return Err(Error::Busy);
            }
            let len = entry.messages.len();
            if index > len {
                return Err(Error::IndexOutOfRange { index, len });
            }
            let convo = Arc::make_mut(entry);
            convo.messages.truncate(index);
            convo.updated_at = chrono::Utc::now().timestamp_millis();
            Ok(())
        })
    }

    /// Edit a past turn: truncate at `index`, publish that state, then append
    /// `new_text` as a fresh user message with its placeholder.
    ///
    /// The truncated list is committed before the new turn exists, so the new
    /// turn never sees the removed tail.
    pub fn edit_and_truncate(&self, id: &ConversationId, index: usize, new_text: &str) -> Result<Appended> {
        self.truncate(id, index)?;
        self.append(Some(id), ChatMessage::user(new_text))
    }

    /// Attach the session used for a conversation's turns
    pub fn attach_session(&self, id: &ConversationId, session: ChatSession) -> Result<()> {
        self.transition(|table| {
            let entry = table
                .get_mut(id)
                .ok_or_else(|| Error::UnknownConversation(id.clone()))?;
            Arc::make_mut(entry).session = Some(session);
            Ok(())
        })
    }

    /// Remove a conversation. A conversation with a reply in flight is kept.
    pub fn remove(&self, id: &ConversationId) -> Result<bool> {
        self.transition(|table| {
            if table.get(id).is_some_and(|c| c.streaming) {
                return Err(Error::Busy);
            }
            Ok(table.remove(id).is_some())
        })
    }

    /// Replace the whole table, e.g. after loading from persistence
    pub fn replace_all(&self, conversations: Vec<Conversation>) {
        let table: ConversationTable = conversations
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(c)))
            .collect();
        let _guard = self.writer.lock();
        self.tx.send_replace(Arc::new(table));
    }
}

fn streaming_entry<'a>(
    table: &'a mut ConversationTable,
    id: &ConversationId,
) -> Result<&'a mut Conversation> {
    let entry = table
        .get_mut(id)
        .ok_or_else(|| Error::UnknownConversation(id.clone()))?;
    if !entry.streaming {
        return Err(Error::NotStreaming(id.clone()));
    }
    Ok(Arc::make_mut(entry))
}

fn replace_last(convo: &mut Conversation, message: Arc<ChatMessage>) {
    match convo.messages.last_mut() {
        Some(last) => *last = message,
        None => convo.messages.push(message),
    }
}
