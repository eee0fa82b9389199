//! JSONL conversation storage
//!
//! Each conversation is one append-only `<id>.jsonl` file. Entries are
//! replayed in order on load: the latest `conversation` entry wins, and a
//! `truncate` entry drops the messages after it.

use async_trait::async_trait;
use parley_ai::ChatMessage;
use parley_chat::{ConversationId, ConversationSummary, Persistence, Result, StoredMessage};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Log entry types for the JSONL format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogEntry {
    /// Conversation row, rewritten on every upsert
    Conversation {
        title: String,
        #[serde(default)]
        model: Option<String>,
        timestamp: i64,
    },
    /// A message in the conversation
    Message {
        id: String,
        message: ChatMessage,
        timestamp: i64,
    },
    /// Messages at or after `len` were removed
    Truncate { len: usize, timestamp: i64 },
}

/// Replayed state of one file
#[derive(Default)]
struct Replay {
    summary: Option<(String, Option<String>)>,
    messages: Vec<ChatMessage>,
    updated_at: i64,
}

/// [`Persistence`] backed by a directory of JSONL files.
///
/// File I/O runs on the blocking pool so the writer task never stalls a
/// runtime worker.
pub struct JsonlPersistence {
    dir: PathBuf,
}

impl JsonlPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &ConversationId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", id))
    }

    /// Append one entry to a conversation file, off the async runtime
    async fn append(&self, id: &ConversationId, entry: LogEntry) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.path(id);
        blocking(move || append_entry(&dir, &path, &entry)).await
    }
}

/// Run blocking file work on tokio's blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(parley_chat::Error::persistence)?
        .map_err(parley_chat::Error::persistence)
}

fn append_entry(dir: &Path, path: &Path, entry: &LogEntry) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let file = File::options().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", serde_json::to_string(entry)?)?;
    writer.flush()
}

fn replay(path: &Path) -> std::io::Result<Replay> {
    let reader = BufReader::new(File::open(path)?);
    let mut replay = Replay::default();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping bad entry in {}: {}", path.display(), e);
                continue;
            }
        };
        match entry {
            LogEntry::Conversation {
                title,
                model,
                timestamp,
            } => {
                replay.summary = Some((title, model));
                replay.updated_at = replay.updated_at.max(timestamp);
            }
            LogEntry::Message {
                message, timestamp, ..
            } => {
                replay.messages.push(message);
                replay.updated_at = replay.updated_at.max(timestamp);
            }
            LogEntry::Truncate { len, timestamp } => {
                replay.messages.truncate(len);
                replay.updated_at = replay.updated_at.max(timestamp);
            }
        }
    }
    Ok(replay)
}

/// Replay every conversation file in `dir`, most recently updated first
fn scan(dir: &Path) -> std::io::Result<Vec<ConversationSummary>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut rows = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match replay(&path) {
            Ok(Replay {
                summary: Some((title, model)),
                updated_at,
                ..
            }) => rows.push(ConversationSummary {
                id: ConversationId::from(id),
                title,
                model,
                updated_at,
            }),
            Ok(_) => tracing::warn!("{} has no conversation entry", path.display()),
            Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
        }
    }

    rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(rows)
}

#[async_trait]
impl Persistence for JsonlPersistence {
    async fn save_conversation(
        &self,
        summary: &ConversationSummary,
    ) -> Result<Option<ConversationSummary>> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let entry = LogEntry::Conversation {
            title: summary.title.clone(),
            model: summary.model.clone(),
            timestamp,
        };
        self.append(&summary.id, entry).await?;
        Ok(Some(ConversationSummary {
            updated_at: timestamp,
            ..summary.clone()
        }))
    }

    async fn save(
        &self,
        conversation_id: &ConversationId,
        message: &ChatMessage,
    ) -> Result<Option<StoredMessage>> {
        let path = self.path(conversation_id);
        if !blocking(move || Ok(path.exists())).await? {
            return Ok(None);
        }
        let row = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
            message: message.clone(),
        };
        let entry = LogEntry::Message {
            id: row.id.clone(),
            message: row.message.clone(),
            timestamp: row.created_at,
        };
        self.append(conversation_id, entry).await?;
        Ok(Some(row))
    }

    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let path = self.path(conversation_id);
        blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            Ok(replay(&path)?.messages)
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<ConversationSummary>> {
        let dir = self.dir.clone();
        blocking(move || scan(&dir)).await
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<bool> {
        let path = self.path(conversation_id);
        blocking(move || {
            if !path.exists() {
                return Ok(false);
            }
            fs::remove_file(path)?;
            Ok(true)
        })
        .await
    }

    async fn truncate(&self, conversation_id: &ConversationId, len: usize) -> Result<()> {
        let path = self.path(conversation_id);
        if !blocking(move || Ok(path.exists())).await? {
            return Ok(());
        }
        let entry = LogEntry::Truncate {
            len,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.append(conversation_id, entry).await
    }
}

/// Format a millisecond timestamp for listings
pub fn timestamp_display(millis: i64) -> String {
    use chrono::{Local, TimeZone};
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
