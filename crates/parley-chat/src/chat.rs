//! Turn controller: runs one outbound turn at a time against the store

use crate::{
    conversation::{Conversation, ConversationId, ConversationSummary},
    error::{Error, Result},
    history::build_history,
    intent::{Route, classify},
    persistence::{Persistence, PersistenceWriter},
    sources::SourceSet,
    store::{Appended, ConversationStore, ConversationTable},
};
use futures::StreamExt;
use parking_lot::Mutex;
use parley_ai::{ChatMessage, ChatSession, Generator, Part, SendMessageArgs, StreamChunk};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Decoded chunks buffered between the transport reader and the store
const CHUNK_QUEUE: usize = 64;

/// How a finished turn ended
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: ConversationId,
    /// Whether the turn created the conversation
    pub created: bool,
    pub route: Route,
    /// The message that replaced the placeholder: the model reply, or an
    /// error-role message if the turn failed
    pub message: Arc<ChatMessage>,
}

impl TurnOutcome {
    /// Whether the turn ended in an error-role message
    pub fn failed(&self) -> bool {
        self.message.role == parley_ai::Role::Error
    }
}

/// Holds the send gate for the duration of a turn
struct TurnGuard<'a>(&'a AtomicBool);

impl<'a> TurnGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| Error::Busy)
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The chat runtime: conversation store, generator and persistence wired
/// together.
pub struct Chat {
    store: Arc<ConversationStore>,
    generator: Arc<dyn Generator>,
    persistence: Arc<dyn Persistence>,
    writer: PersistenceWriter,
    model: Mutex<String>,
    busy: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Chat {
    /// Create a runtime. Must be called inside a tokio runtime, since the
    /// persistence writer is spawned here.
    pub fn new(
        generator: Arc<dyn Generator>,
        persistence: Arc<dyn Persistence>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            store: Arc::new(ConversationStore::new()),
            writer: PersistenceWriter::spawn(Arc::clone(&persistence)),
            generator,
            persistence,
            model: Mutex::new(model.into()),
            busy: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// The conversation store
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Subscribe to store snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversationTable>> {
        self.store.subscribe()
    }

    /// Conversations, most recently updated first
    pub fn list(&self) -> Vec<ConversationSummary> {
        self.store.list()
    }

    /// Model used for new turns
    pub fn model(&self) -> String {
        self.model.lock().clone()
    }

    /// Select the model for new turns
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        if !parley_ai::models::is_known(&model) {
            tracing::debug!("Selected unlisted model '{}'", model);
        }
        *self.model.lock() = model;
    }

    /// Whether a turn is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Cancel the turn in flight, if any
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Wait for every queued persistence write to run
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Replace the store's contents with everything persisted.
    ///
    /// Returns the number of conversations loaded. Fails with
    /// [`Error::Busy`] while a turn is in flight.
    pub async fn restore(&self) -> Result<usize> {
        let _guard = TurnGuard::acquire(&self.busy)?;
        let summaries = self.persistence.load_all().await?;
        let mut conversations = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let messages = self.persistence.load(&summary.id).await?;
            let session = summary
                .model
                .as_ref()
                .map(|m| ChatSession::new(Arc::clone(&self.generator), m.clone()));
            conversations.push(Conversation::restored(summary, messages, session));
        }
        let count = conversations.len();
        self.store.replace_all(conversations);
        tracing::debug!("Restored {} conversations", count);
        Ok(count)
    }

    /// Remove a conversation from the store and from persistence
    pub fn delete(&self, id: &ConversationId) -> Result<bool> {
        let removed = self.store.remove(id)?;
        if removed {
            self.writer.delete(id.clone());
        }
        Ok(removed)
    }

    /// Send a turn. With no id a new conversation is started.
    ///
    /// Backend failures do not fail the call: they end the turn with an
    /// error-role message, reported through [`TurnOutcome::failed`].
    pub async fn send(
        &self,
        conversation_id: Option<ConversationId>,
        text: &str,
        attachments: Vec<Part>,
    ) -> Result<TurnOutcome> {
        let _guard = TurnGuard::acquire(&self.busy)?;
        let token = self.reset_cancel();

        let parts = user_parts(text, attachments);
        let route = classify(text, &parts);
        let appended = self
            .store
            .append(conversation_id.as_ref(), ChatMessage::user_with_parts(parts.clone()))?;

        Ok(self.run_turn(appended, text, parts, route, token).await)
    }

    /// Replace the message at `index` with `text` and resend from there.
    ///
    /// Everything at or after `index` is dropped first; the new turn starts
    /// only once the truncated list has been committed.
    pub async fn edit(&self, id: &ConversationId, index: usize, text: &str) -> Result<TurnOutcome> {
        let _guard = TurnGuard::acquire(&self.busy)?;
        let token = self.reset_cancel();

        // Error rows are never persisted, so the stored index skips them
        let stored_len = self.store.get(id).map(|c| persisted_len(&c.messages, index));
        let appended = self.store.edit_and_truncate(id, index, text)?;
        if let Some(len) = stored_len {
            self.writer.truncate(id.clone(), len);
        }

        let parts = vec![Part::text(text)];
        let route = classify(text, &parts);
        Ok(self.run_turn(appended, text, parts, route, token).await)
    }

    fn reset_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    /// Session for a conversation, attached on first use or when the
    /// selected model changes
    fn session_for(&self, id: &ConversationId, model: &str) -> Result<ChatSession> {
        let existing = self.store.get(id).and_then(|c| c.session.clone());
        match existing {
            Some(session) if session.default_model() == model => Ok(session),
            _ => {
                let session = ChatSession::new(Arc::clone(&self.generator), model);
                self.store.attach_session(id, session.clone())?;
                Ok(session)
            }
        }
    }

    async fn run_turn(
        &self,
        appended: Appended,
        text: &str,
        parts: Vec<Part>,
        route: Route,
        token: CancellationToken,
    ) -> TurnOutcome {
        let id = appended.conversation_id.clone();
        let model = self.model();
        tracing::debug!("Turn on {} routed to {:?} (model={})", id, route, model);

        let result = match self.session_for(&id, &model) {
            Ok(session) => {
                self.persist_turn_start(&id, &appended);
                match route {
                    Route::Stream => {
                        let args = SendMessageArgs {
                            message: text.to_string(),
                            history: build_history(&appended.prior),
                            parts: if parts.iter().any(Part::has_inline_data) {
                                parts
                            } else {
                                Vec::new()
                            },
                            model: Some(model),
                        };
                        self.run_stream(&id, session, args, token).await
                    }
                    Route::Image => self.run_image(&id, session, &parts, token).await,
                }
            }
            Err(e) => Err(e),
        };

        let message = match result {
            Ok(message) => {
                self.writer.save(id.clone(), ChatMessage::clone(&message));
                message
            }
            Err(e) => {
                let description = e.describe();
                tracing::error!("Turn on {} failed: {}", id, description);
                match self.store.fail(&id, description.clone()) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Could not record failure on {}: {}", id, e);
                        Arc::new(ChatMessage::error(description))
                    }
                }
            }
        };

        TurnOutcome {
            conversation_id: id,
            created: appended.created,
            route,
            message,
        }
    }

    /// Queue the conversation row before the user message so the adapter
    /// always sees them in that order
    fn persist_turn_start(&self, id: &ConversationId, appended: &Appended) {
        if let Some(convo) = self.store.get(id) {
            self.writer.save_conversation(convo.summary());
        }
        self.writer
            .save(id.clone(), ChatMessage::clone(&appended.user_message));
    }

    /// Read chunks on a producer task and apply them to the store in arrival
    /// order until the body ends, fails, or the turn is cancelled.
    async fn run_stream(
        &self,
        id: &ConversationId,
        session: ChatSession,
        args: SendMessageArgs,
        token: CancellationToken,
    ) -> Result<Arc<ChatMessage>> {
        let (tx, mut rx) = mpsc::channel::<parley_ai::Result<StreamChunk>>(CHUNK_QUEUE);
        let producer_token = token.clone();
        let producer = tokio::spawn(async move {
            let opened = tokio::select! {
                _ = producer_token.cancelled() => return,
                opened = session.send_message_stream(args) => opened,
            };
            let mut chunks = match opened {
                Ok(chunks) => chunks,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            loop {
                let next = tokio::select! {
                    _ = producer_token.cancelled() => break,
                    next = chunks.next() => next,
                };
                let Some(item) = next else { break };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        let mut text = String::new();
        let mut sources = SourceSet::new();
        let mut received = 0usize;

        let outcome = loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break Err(Error::Aborted),
                item = rx.recv() => item,
            };
            match item {
                Some(Ok(chunk)) => {
                    received += 1;
                    text.push_str(chunk.text_or_empty());
                    sources.extend(chunk.sources());
                    if let Err(e) = self.store.stream_update(id, &text, sources.as_slice()) {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };
        producer.abort();
        tracing::debug!("Applied {} chunks to {}", received, id);

        match outcome {
            Ok(()) => self
                .store
                .finalize(id, ChatMessage::model(text, sources.into_vec())),
            // Keep whatever arrived before the abort
            Err(Error::Aborted) if !text.is_empty() => {
                tracing::debug!("Turn on {} aborted after {} chunks", id, received);
                self.store
                    .finalize(id, ChatMessage::model(text, sources.into_vec()))
            }
            Err(e) => Err(e),
        }
    }

    async fn run_image(
        &self,
        id: &ConversationId,
        session: ChatSession,
        parts: &[Part],
        token: CancellationToken,
    ) -> Result<Arc<ChatMessage>> {
        let result = tokio::select! {
            _ = token.cancelled() => return Err(Error::Aborted),
            result = session.generate_image(parts) => result?,
        };
        tracing::debug!("Image turn on {} returned {} parts", id, result.len());
        self.store.finalize(id, ChatMessage::model_with_parts(result))
    }
}

/// `[text]` alone, or the text (when non-empty) followed by attachments
fn user_parts(text: &str, attachments: Vec<Part>) -> Vec<Part> {
    if attachments.is_empty() {
        return vec![Part::text(text)];
    }
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if !text.is_empty() {
        parts.push(Part::text(text));
    }
    parts.extend(attachments);
    parts
}

/// Number of persisted rows among the first `index` messages
fn persisted_len(messages: &[Arc<ChatMessage>], index: usize) -> usize {
    messages
        .iter()
        .take(index)
        .filter(|m| m.role != parley_ai::Role::Error)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use async_trait::async_trait;
    use parley_ai::{ChunkStream, GenerateRequest, GroundingSource, Role};
    use serde_json::json;
    use std::collections::VecDeque;

    /// One scripted backend response
    enum Reply {
        Chunks(Vec<StreamChunk>),
        /// Chunks followed by a body that never ends
        Stall(Vec<StreamChunk>),
        /// Chunks followed by a read failure
        Broken(Vec<StreamChunk>),
        Fail(parley_ai::Error),
        Image(Vec<Part>),
    }

    #[derive(Default)]
    struct Scripted {
        replies: std::sync::Mutex<VecDeque<Reply>>,
        requests: std::sync::Mutex<Vec<GenerateRequest>>,
        image_calls: std::sync::Mutex<Vec<Vec<Part>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(replies.into()),
                ..Default::default()
            })
        }

        fn next(&self) -> Reply {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted reply left")
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate_stream(&self, request: &GenerateRequest) -> parley_ai::Result<ChunkStream> {
            self.requests.lock().unwrap().push(request.clone());
            let chunks = |c: Vec<StreamChunk>| futures::stream::iter(c.into_iter().map(Ok));
            match self.next() {
                Reply::Chunks(c) => Ok(Box::pin(chunks(c))),
                Reply::Stall(c) => Ok(Box::pin(chunks(c).chain(futures::stream::pending()))),
                Reply::Broken(c) => Ok(Box::pin(chunks(c).chain(futures::stream::once(async {
                    Err(parley_ai::Error::UnexpectedResponse("connection reset".into()))
                })))),
                Reply::Fail(e) => Err(e),
                Reply::Image(_) => panic!("image reply scripted for a stream call"),
            }
        }

        async fn generate_image(&self, parts: &[Part]) -> parley_ai::Result<Vec<Part>> {
            self.image_calls.lock().unwrap().push(parts.to_vec());
            match self.next() {
                Reply::Image(parts) => Ok(parts),
                Reply::Fail(e) => Err(e),
                _ => panic!("stream reply scripted for an image call"),
            }
        }
    }

    fn chat(generator: Arc<Scripted>) -> (Chat, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let chat = Chat::new(generator, persistence.clone(), "gemma-3-27b-it");
        (chat, persistence)
    }

    fn text(t: &str) -> StreamChunk {
        StreamChunk::from_text(t)
    }

    fn cited(t: &str, uri: &str) -> StreamChunk {
        let object = json!({
            "text": t,
            "candidates": [{"groundingMetadata": {"groundingChunks": [{"web": {"uri": uri}}]}}]
        });
        match object {
            serde_json::Value::Object(map) => StreamChunk::from_object(map),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_stream_turn_accumulates_text() {
        let generator = Scripted::new(vec![Reply::Chunks(vec![text("Hel"), text("lo")])]);
        let (chat, _) = chat(generator.clone());

        let outcome = chat.send(None, "hi", vec![]).await.unwrap();
        assert!(outcome.created);
        assert!(!outcome.failed());
        assert_eq!(outcome.route, Route::Stream);
        assert_eq!(outcome.message.text(), "Hello");

        let convo = chat.store().get(&outcome.conversation_id).unwrap();
        assert!(!convo.streaming);
        assert_eq!(convo.messages.len(), 2);
        assert!(Arc::ptr_eq(&convo.messages[1], &outcome.message));
        assert!(!chat.is_busy());

        let request = &generator.requests.lock().unwrap()[0];
        assert_eq!(request.prompt.as_deref(), Some("hi"));
        assert!(request.history.is_none());
        assert_eq!(request.model.as_deref(), Some("gemma-3-27b-it"));
    }

    #[tokio::test]
    async fn test_observer_sees_final_text() {
        let generator = Scripted::new(vec![Reply::Chunks(vec![text("a"), text("b"), text("c")])]);
        let (chat, _) = chat(generator);
        let mut rx = chat.subscribe();

        let seen = tokio::spawn(async move {
            let mut texts = Vec::new();
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(last) = snapshot.values().next().and_then(|c| c.last().cloned()) {
                    texts.push(last.text());
                }
                if texts.last().is_some_and(|t| t == "abc") {
                    break;
                }
            }
            texts
        });

        chat.send(None, "go", vec![]).await.unwrap();
        let texts = seen.await.unwrap();
        assert_eq!(texts.last().map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_sources_deduped_across_chunks() {
        let generator = Scripted::new(vec![Reply::Chunks(vec![
            cited("x", "a"),
            cited("y", "b"),
            cited("z", "a"),
        ])]);
        let (chat, _) = chat(generator);
        let outcome = chat.send(None, "cite", vec![]).await.unwrap();
        assert_eq!(outcome.message.text(), "xyz");
        assert_eq!(
            outcome.message.sources(),
            &[GroundingSource::new("a"), GroundingSource::new("b")]
        );
    }

    #[tokio::test]
    async fn test_transport_error_becomes_error_message() {
        let generator = Scripted::new(vec![Reply::Fail(parley_ai::Error::status(500, "boom"))]);
        let (chat, _) = chat(generator);

        let outcome = chat.send(None, "hi", vec![]).await.unwrap();
        assert!(outcome.failed());
        assert_eq!(outcome.message.text(), "Server responded 500: boom");

        let convo = chat.store().get(&outcome.conversation_id).unwrap();
        assert!(!convo.streaming);
        assert_eq!(convo.messages[0].text(), "hi");
        assert_eq!(convo.messages[1].role, Role::Error);
    }

    #[tokio::test]
    async fn test_validation_error_shows_server_text() {
        let generator = Scripted::new(vec![Reply::Fail(parley_ai::Error::status(
            400,
            r#"{"error":"Missing 'prompt' string or 'parts' array in body."}"#,
        ))]);
        let (chat, _) = chat(generator);
        let outcome = chat.send(None, "", vec![]).await.unwrap();
        assert_eq!(
            outcome.message.text(),
            "Missing 'prompt' string or 'parts' array in body."
        );
    }

    #[tokio::test]
    async fn test_read_failure_keeps_earlier_messages() {
        let generator = Scripted::new(vec![
            Reply::Chunks(vec![text("first")]),
            Reply::Broken(vec![text("par")]),
        ]);
        let (chat, _) = chat(generator);
        let first = chat.send(None, "one", vec![]).await.unwrap();
        let id = first.conversation_id.clone();
        let second = chat.send(Some(id.clone()), "two", vec![]).await.unwrap();

        assert!(second.failed());
        let convo = chat.store().get(&id).unwrap();
        assert_eq!(convo.messages.len(), 4);
        assert!(Arc::ptr_eq(&convo.messages[1], &first.message));
        assert_eq!(convo.messages[3].role, Role::Error);
    }

    #[tokio::test]
    async fn test_history_excludes_errors_and_new_turn() {
        let generator = Scripted::new(vec![
            Reply::Fail(parley_ai::Error::status(500, "boom")),
            Reply::Chunks(vec![text("ok")]),
        ]);
        let (chat, _) = chat(generator.clone());
        let first = chat.send(None, "one", vec![]).await.unwrap();
        chat.send(Some(first.conversation_id), "two", vec![])
            .await
            .unwrap();

        let requests = generator.requests.lock().unwrap();
        let history = requests[1].history.clone().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].parts, vec![Part::text("one")]);
        assert_eq!(requests[1].prompt.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_image_route() {
        let generator = Scripted::new(vec![Reply::Image(vec![Part::inline("AAAA", "image/png")])]);
        let (chat, _) = chat(generator.clone());

        let outcome = chat
            .send(None, "Generate an image of a cat", vec![])
            .await
            .unwrap();
        assert_eq!(outcome.route, Route::Image);
        assert_eq!(outcome.message.parts, vec![Part::inline("AAAA", "image/png")]);
        assert!(generator.requests.lock().unwrap().is_empty());
        assert_eq!(
            generator.image_calls.lock().unwrap()[0],
            vec![Part::text("Generate an image of a cat")]
        );
    }

    #[tokio::test]
    async fn test_attachment_keeps_stream_route_and_sends_parts() {
        let generator = Scripted::new(vec![Reply::Chunks(vec![text("a cat")])]);
        let (chat, _) = chat(generator.clone());
        let photo = Part::inline("AAAA", "image/jpeg");

        let outcome = chat
            .send(None, "Show me what is in this picture", vec![photo.clone()])
            .await
            .unwrap();
        assert_eq!(outcome.route, Route::Stream);

        let request = &generator.requests.lock().unwrap()[0];
        assert!(request.prompt.is_none());
        assert_eq!(
            request.parts.clone().unwrap(),
            vec![Part::text("Show me what is in this picture"), photo]
        );
    }

    #[tokio::test]
    async fn test_gate_rejects_concurrent_send() {
        let generator = Scripted::new(vec![Reply::Stall(vec![])]);
        let (chat, _) = chat(generator);
        let chat = Arc::new(chat);
        let mut rx = chat.subscribe();

        let running = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send(None, "slow", vec![]).await })
        };
        rx.changed().await.unwrap();
        assert!(chat.is_busy());
        assert!(matches!(chat.send(None, "second", vec![]).await, Err(Error::Busy)));

        chat.abort();
        running.await.unwrap().unwrap();
        assert!(!chat.is_busy());
    }

    #[tokio::test]
    async fn test_restore_rejected_mid_turn() {
        let generator = Scripted::new(vec![Reply::Stall(vec![text("partial")])]);
        let (chat, _) = chat(generator);
        let chat = Arc::new(chat);
        let mut rx = chat.subscribe();

        let running = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send(None, "slow", vec![]).await })
        };
        rx.changed().await.unwrap();
        assert!(matches!(chat.restore().await, Err(Error::Busy)));
        assert_eq!(chat.list().len(), 1);

        chat.abort();
        let outcome = running.await.unwrap().unwrap();
        assert!(chat.store().get(&outcome.conversation_id).is_some());
        assert!(!chat.is_busy());
    }

    #[tokio::test]
    async fn test_abort_keeps_partial_text() {
        let generator = Scripted::new(vec![Reply::Stall(vec![text("partial")])]);
        let (chat, _) = chat(generator);
        let chat = Arc::new(chat);
        let mut rx = chat.subscribe();

        let running = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send(None, "hi", vec![]).await })
        };
        loop {
            rx.changed().await.unwrap();
            let snapshot = rx.borrow_and_update().clone();
            if snapshot
                .values()
                .any(|c| c.last().is_some_and(|m| m.text() == "partial"))
            {
                break;
            }
        }
        chat.abort();

        let outcome = running.await.unwrap().unwrap();
        assert!(!outcome.failed());
        assert_eq!(outcome.message.text(), "partial");
    }

    #[tokio::test]
    async fn test_abort_before_any_text() {
        let generator = Scripted::new(vec![Reply::Stall(vec![])]);
        let (chat, _) = chat(generator);
        let chat = Arc::new(chat);
        let mut rx = chat.subscribe();

        let running = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send(None, "hi", vec![]).await })
        };
        rx.changed().await.unwrap();
        chat.abort();

        let outcome = running.await.unwrap().unwrap();
        assert!(outcome.failed());
        assert_eq!(outcome.message.text(), "Request aborted");
    }

    #[tokio::test]
    async fn test_edit_truncates_then_resends() {
        let generator = Scripted::new(vec![
            Reply::Chunks(vec![text("r1")]),
            Reply::Chunks(vec![text("r2")]),
            Reply::Chunks(vec![text("r1 again")]),
        ]);
        let (chat, persistence) = chat(generator.clone());
        let id = chat.send(None, "one", vec![]).await.unwrap().conversation_id;
        chat.send(Some(id.clone()), "two", vec![]).await.unwrap();

        let outcome = chat.edit(&id, 0, "uno").await.unwrap();
        assert_eq!(outcome.message.text(), "r1 again");

        let convo = chat.store().get(&id).unwrap();
        let texts: Vec<_> = convo.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["uno", "r1 again"]);
        assert!(generator.requests.lock().unwrap()[2].history.is_none());

        chat.flush().await;
        let stored: Vec<_> = persistence
            .load(&id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.text())
            .collect();
        assert_eq!(stored, vec!["uno", "r1 again"]);
    }

    #[tokio::test]
    async fn test_edit_after_failed_turn_truncates_stored_rows() {
        let generator = Scripted::new(vec![
            Reply::Fail(parley_ai::Error::status(500, "boom")),
            Reply::Chunks(vec![text("r2")]),
            Reply::Chunks(vec![text("r2 again")]),
        ]);
        let (chat, persistence) = chat(generator);
        let id = chat.send(None, "one", vec![]).await.unwrap().conversation_id;
        chat.send(Some(id.clone()), "two", vec![]).await.unwrap();

        chat.edit(&id, 2, "deux").await.unwrap();
        chat.flush().await;

        let convo = chat.store().get(&id).unwrap();
        let memory: Vec<_> = convo.messages.iter().map(|m| m.text()).collect();
        assert_eq!(
            memory,
            vec!["one", "Server responded 500: boom", "deux", "r2 again"]
        );

        let stored: Vec<_> = persistence
            .load(&id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.text())
            .collect();
        assert_eq!(stored, vec!["one", "deux", "r2 again"]);
    }

    #[tokio::test]
    async fn test_edit_out_of_range_releases_gate() {
        let generator = Scripted::new(vec![Reply::Chunks(vec![text("r1")])]);
        let (chat, _) = chat(generator);
        let id = chat.send(None, "one", vec![]).await.unwrap().conversation_id;
        assert!(matches!(
            chat.edit(&id, 5, "x").await,
            Err(Error::IndexOutOfRange { index: 5, len: 2 })
        ));
        assert!(!chat.is_busy());
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let generator = Scripted::new(vec![
            Reply::Chunks(vec![text("hello")]),
            Reply::Fail(parley_ai::Error::status(500, "boom")),
        ]);
        let (chat, persistence) = chat(generator.clone());
        let id = chat
            .send(None, "Say hello to me please now", vec![])
            .await
            .unwrap()
            .conversation_id;
        chat.send(Some(id.clone()), "again", vec![]).await.unwrap();
        chat.flush().await;

        let restored = Chat::new(generator, persistence, "gemma-3-27b-it");
        assert_eq!(restored.restore().await.unwrap(), 1);
        let convo = restored.store().get(&id).unwrap();
        assert_eq!(convo.title, "Say hello to me please");
        // Error replies are not persisted
        let texts: Vec<_> = convo.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["Say hello to me please now", "hello", "again"]);
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let generator = Scripted::new(vec![Reply::Chunks(vec![text("r")])]);
        let (chat, persistence) = chat(generator);
        let id = chat.send(None, "hi", vec![]).await.unwrap().conversation_id;

        assert!(chat.delete(&id).unwrap());
        chat.flush().await;
        assert!(chat.store().get(&id).is_none());
        assert!(persistence.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_switch_applies_to_next_turn() {
        let generator = Scripted::new(vec![
            Reply::Chunks(vec![text("a")]),
            Reply::Chunks(vec![text("b")]),
        ]);
        let (chat, _) = chat(generator.clone());
        let id = chat.send(None, "one", vec![]).await.unwrap().conversation_id;
        chat.set_model("gemini-2.5-flash");
        chat.send(Some(id.clone()), "two", vec![]).await.unwrap();

        let models: Vec<_> = generator
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.model.clone().unwrap())
            .collect();
        assert_eq!(models, vec!["gemma-3-27b-it", "gemini-2.5-flash"]);
        assert_eq!(
            chat.list()[0].model.as_deref(),
            Some("gemini-2.5-flash")
        );
    }

    #[test]
    fn test_user_parts_shape() {
        assert_eq!(user_parts("hi", vec![]), vec![Part::text("hi")]);
        assert_eq!(user_parts("", vec![]), vec![Part::text("")]);
        let photo = Part::inline("AAAA", "image/png");
        assert_eq!(user_parts("", vec![photo.clone()]), vec![photo.clone()]);
        assert_eq!(
            user_parts("look", vec![photo.clone()]),
            vec![Part::text("look"), photo]
        );
    }
}
