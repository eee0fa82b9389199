//! Persistence adapter interface and the background writer that feeds it

use crate::{
    conversation::{ConversationId, ConversationSummary},
    error::Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use parley_ai::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A message row as stored by an adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    /// Milliseconds since the epoch
    pub created_at: i64,
    pub message: ChatMessage,
}

/// Storage for conversations and their messages.
///
/// Callers treat every method as fallible and non-essential: in-memory state
/// is never rolled back because a call failed.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Upsert the conversation row and bump its recency
    async fn save_conversation(
        &self,
        summary: &ConversationSummary,
    ) -> Result<Option<ConversationSummary>>;

    /// Append a message to a conversation
    async fn save(
        &self,
        conversation_id: &ConversationId,
        message: &ChatMessage,
    ) -> Result<Option<StoredMessage>>;

    /// Messages of one conversation in insertion order
    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>>;

    /// Every conversation, most recently updated first
    async fn load_all(&self) -> Result<Vec<ConversationSummary>>;

    /// Remove a conversation and its messages
    async fn delete(&self, conversation_id: &ConversationId) -> Result<bool>;

    /// Drop stored messages at or after `len`
    async fn truncate(&self, conversation_id: &ConversationId, len: usize) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationSummary>,
    messages: HashMap<ConversationId, Vec<StoredMessage>>,
    clock: i64,
}

impl MemoryState {
    /// Strictly increasing stamp so recency order is total
    fn tick(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.clock = now.max(self.clock + 1);
        self.clock
    }
}

/// In-process adapter, used by tests and as a no-setup default
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_conversation(
        &self,
        summary: &ConversationSummary,
    ) -> Result<Option<ConversationSummary>> {
        let mut state = self.state.lock();
        let updated_at = state.tick();
        let row = ConversationSummary {
            updated_at,
            ..summary.clone()
        };
        state.conversations.insert(row.id.clone(), row.clone());
        Ok(Some(row))
    }

    async fn save(
        &self,
        conversation_id: &ConversationId,
        message: &ChatMessage,
    ) -> Result<Option<StoredMessage>> {
        let mut state = self.state.lock();
        if !state.conversations.contains_key(conversation_id) {
            return Ok(None);
        }
        let created_at = state.tick();
        let row = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            created_at,
            message: message.clone(),
        };
        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(row.clone());
        if let Some(convo) = state.conversations.get_mut(conversation_id) {
            convo.updated_at = created_at;
        }
        Ok(Some(row))
    }

    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock();
        Ok(state
            .messages
            .get(conversation_id)
            .map(|rows| rows.iter().map(|r| r.message.clone()).collect())
            .unwrap_or_default())
    }

    async fn load_all(&self) -> Result<Vec<ConversationSummary>> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state.conversations.values().cloned().collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<bool> {
        let mut state = self.state.lock();
        state.messages.remove(conversation_id);
        Ok(state.conversations.remove(conversation_id).is_some())
    }

    async fn truncate(&self, conversation_id: &ConversationId, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(rows) = state.messages.get_mut(conversation_id) {
            rows.truncate(len);
        }
        Ok(())
    }
}

enum WriteOp {
    Conversation(ConversationSummary),
    Message(ConversationId, ChatMessage),
    Truncate(ConversationId, usize),
    Delete(ConversationId),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front of a [`Persistence`] adapter.
///
/// Calls are queued and executed one at a time on a background task, in the
/// order they were issued. Failures are logged and dropped.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl PersistenceWriter {
    /// Start the writer task on the current runtime
    pub fn spawn(persistence: Arc<dyn Persistence>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Conversation(summary) => {
                        if let Err(e) = persistence.save_conversation(&summary).await {
                            tracing::warn!("Failed to save conversation {}: {}", summary.id, e);
                        }
                    }
                    WriteOp::Message(id, message) => match persistence.save(&id, &message).await {
                        Ok(Some(_)) => {}
                        Ok(None) => tracing::warn!("Message for {} was not stored", id),
                        Err(e) => tracing::warn!("Failed to save message for {}: {}", id, e),
                    },
                    WriteOp::Truncate(id, len) => {
                        if let Err(e) = persistence.truncate(&id, len).await {
                            tracing::warn!("Failed to truncate {} to {}: {}", id, len, e);
                        }
                    }
                    WriteOp::Delete(id) => {
                        if let Err(e) = persistence.delete(&id).await {
                            tracing::warn!("Failed to delete {}: {}", id, e);
                        }
                    }
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("Persistence writer stopped");
        });

        Self { tx }
    }

    fn push(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Persistence writer is gone; dropping write");
        }
    }

    pub fn save_conversation(&self, summary: ConversationSummary) {
        self.push(WriteOp::Conversation(summary));
    }

    pub fn save(&self, conversation_id: ConversationId, message: ChatMessage) {
        self.push(WriteOp::Message(conversation_id, message));
    }

    pub fn truncate(&self, conversation_id: ConversationId, len: usize) {
        self.push(WriteOp::Truncate(conversation_id, len));
    }

    pub fn delete(&self, conversation_id: ConversationId) {
        self.push(WriteOp::Delete(conversation_id));
    }

    /// Wait until every write issued before this call has run
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.push(WriteOp::Flush(done));
        let _ = wait.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn summary(id: &str, title: &str) -> ConversationSummary {
        ConversationSummary {
            id: id.into(),
            title: title.into(),
            model: Some("gemma-3-27b-it".into()),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_round_trip_in_order() {
        let p = MemoryPersistence::new();
        let id = ConversationId::from("c1");
        p.save_conversation(&summary("c1", "Hi")).await.unwrap();
        p.save(&id, &ChatMessage::user("one")).await.unwrap();
        p.save(&id, &ChatMessage::model("two", vec![])).await.unwrap();

        let loaded = p.load(&id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].text(), "one");
        assert_eq!(loaded[1].text(), "two");
    }

    #[tokio::test]
    async fn test_save_without_conversation_row_returns_none() {
        let p = MemoryPersistence::new();
        let row = p
            .save(&ConversationId::from("nope"), &ChatMessage::user("x"))
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn test_load_all_most_recent_first() {
        let p = MemoryPersistence::new();
        p.save_conversation(&summary("a", "A")).await.unwrap();
        p.save_conversation(&summary("b", "B")).await.unwrap();
        p.save(&ConversationId::from("a"), &ChatMessage::user("bump"))
            .await
            .unwrap();

        let ids: Vec<_> = p
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete_and_truncate() {
        let p = MemoryPersistence::new();
        let id = ConversationId::from("c1");
        p.save_conversation(&summary("c1", "Hi")).await.unwrap();
        for text in ["a", "b", "c"] {
            p.save(&id, &ChatMessage::user(text)).await.unwrap();
        }
        p.truncate(&id, 1).await.unwrap();
        assert_eq!(p.load(&id).await.unwrap().len(), 1);

        assert!(p.delete(&id).await.unwrap());
        assert!(!p.delete(&id).await.unwrap());
        assert!(p.load(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writer_runs_in_issue_order() {
        let p = Arc::new(MemoryPersistence::new());
        let writer = PersistenceWriter::spawn(p.clone());
        let id = ConversationId::from("c1");

        writer.save_conversation(summary("c1", "Hi"));
        writer.save(id.clone(), ChatMessage::user("one"));
        writer.save(id.clone(), ChatMessage::model("two", vec![]));
        writer.flush().await;

        let texts: Vec<_> = p.load(&id).await.unwrap().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    struct Failing;

    #[async_trait]
    impl Persistence for Failing {
        async fn save_conversation(&self, _: &ConversationSummary) -> Result<Option<ConversationSummary>> {
            Err(Error::persistence("disk full"))
        }
        async fn save(&self, _: &ConversationId, _: &ChatMessage) -> Result<Option<StoredMessage>> {
            Err(Error::persistence("disk full"))
        }
        async fn load(&self, _: &ConversationId) -> Result<Vec<ChatMessage>> {
            Err(Error::persistence("disk full"))
        }
        async fn load_all(&self) -> Result<Vec<ConversationSummary>> {
            Err(Error::persistence("disk full"))
        }
        async fn delete(&self, _: &ConversationId) -> Result<bool> {
            Err(Error::persistence("disk full"))
        }
        async fn truncate(&self, _: &ConversationId, _: usize) -> Result<()> {
            Err(Error::persistence("disk full"))
        }
    }

    #[tokio::test]
    async fn test_writer_survives_failures() {
        let writer = PersistenceWriter::spawn(Arc::new(Failing));
        writer.save_conversation(summary("c1", "Hi"));
        writer.save("c1".into(), ChatMessage::user("x"));
        writer.delete("c1".into());
        writer.flush().await;
        // Still accepting work after errors
        writer.truncate("c1".into(), 0);
        writer.flush().await;
    }
}
