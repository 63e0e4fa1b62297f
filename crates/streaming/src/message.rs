//! Chat message records: the thing a client asks to create and then
//! streams events for. One `Message` per agent run, keyed by `message_id`.
//!
//! Storage is JSONL-append plus an in-memory index, except updates are
//! by-id rather than ring-bounded, since a message's final status must
//! survive indefinitely, not just until the ring evicts it.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ts_domain::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the run pauses for human input. The message stays in
    /// `Running` (there is no terminal "interrupted" status — spec.md §3
    /// only has pending/processing/completed/failed) until the higher
    /// layer resumes it.
    #[serde(default)]
    pub interrupted: bool,
    /// The agent-graph thread id, retained so a resume action can pick
    /// the same thread back up. Set alongside `interrupted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// The tool name and payload (typically `{question, context}`) the
    /// graph surfaced when it asked for human input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_payload: Option<serde_json::Value>,
}

impl Message {
    pub fn new_user_turn(message_id: impl Into<String>, chat_id: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            chat_id: chat_id.into(),
            role: MessageRole::Assistant,
            status: MessageStatus::Queued,
            query: query.into(),
            created_at: now,
            updated_at: now,
            final_text: None,
            error: None,
            interrupted: false,
            thread_id: None,
            interrupt_payload: None,
        }
    }
}

/// Durable message storage, updated in place as a run progresses through
/// `Queued -> Running -> {Completed, Failed}`, possibly pausing in
/// `Running` with `interrupted=true` along the way.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: Message) -> Result<()>;

    async fn get(&self, message_id: &str) -> Result<Option<Message>>;

    /// Apply `update` to the stored message and persist the result.
    /// Returns `Error::Store` if no message with that id exists.
    async fn update(
        &self,
        message_id: &str,
        update: Box<dyn FnOnce(&mut Message) + Send>,
    ) -> Result<Message>;

    async fn list_for_chat(&self, chat_id: &str) -> Result<Vec<Message>>;
}

struct Inner {
    by_id: HashMap<String, Message>,
}

pub struct JsonlMessageStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl JsonlMessageStore {
    /// Load `path` if it exists, folding by `message_id` with last-write-
    /// wins semantics (later lines in the file override earlier ones for
    /// the same id), rebuilding the in-memory index from the JSONL log on
    /// startup.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut by_id = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(&path) {
            for line in content.lines() {
                if let Ok(message) = serde_json::from_str::<Message>(line) {
                    by_id.insert(message.message_id.clone(), message);
                }
            }
        }

        Ok(Self { path, inner: RwLock::new(Inner { by_id }) })
    }

    fn append_line(path: &Path, message: &Message) -> std::io::Result<()> {
        let json = serde_json::to_string(message)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{json}")
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn create(&self, message: Message) -> Result<()> {
        Self::append_line(&self.path, &message)?;
        self.inner.write().by_id.insert(message.message_id.clone(), message);
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self.inner.read().by_id.get(message_id).cloned())
    }

    async fn update(
        &self,
        message_id: &str,
        update: Box<dyn FnOnce(&mut Message) + Send>,
    ) -> Result<Message> {
        let updated = {
            let mut inner = self.inner.write();
            let message = inner
                .by_id
                .get_mut(message_id)
                .ok_or_else(|| Error::Store(format!("no message {message_id}")))?;
            update(message);
            message.updated_at = Utc::now();
            message.clone()
        };
        Self::append_line(&self.path, &updated)?;
        Ok(updated)
    }

    async fn list_for_chat(&self, chat_id: &str) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .inner
            .read()
            .by_id
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> (PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (dir.path().join("messages.jsonl"), dir)
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let (path, _dir) = temp_path();
        let store = JsonlMessageStore::new(&path).unwrap();
        let message = Message::new_user_turn("m1", "c1", "what tenders closed this week?");
        store.create(message.clone()).await.unwrap();

        let fetched = store.get("m1").await.unwrap().unwrap();
        assert_eq!(fetched.message_id, "m1");
        assert_eq!(fetched.status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn update_mutates_and_persists() {
        let (path, _dir) = temp_path();
        let store = JsonlMessageStore::new(&path).unwrap();
        store.create(Message::new_user_turn("m1", "c1", "q")).await.unwrap();

        let updated = store
            .update(
                "m1",
                Box::new(|m| {
                    m.status = MessageStatus::Completed;
                    m.final_text = Some("done".into());
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, MessageStatus::Completed);
        assert_eq!(updated.final_text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn update_on_unknown_message_errors() {
        let (path, _dir) = temp_path();
        let store = JsonlMessageStore::new(&path).unwrap();
        let result = store.update("nope", Box::new(|_| {})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reopening_store_folds_last_write_wins() {
        let (path, _dir) = temp_path();
        {
            let store = JsonlMessageStore::new(&path).unwrap();
            store.create(Message::new_user_turn("m1", "c1", "q")).await.unwrap();
            store
                .update("m1", Box::new(|m| m.status = MessageStatus::Running))
                .await
                .unwrap();
            store
                .update("m1", Box::new(|m| m.status = MessageStatus::Completed))
                .await
                .unwrap();
        }

        let store = JsonlMessageStore::new(&path).unwrap();
        let message = store.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn list_for_chat_filters_and_orders_by_creation() {
        let (path, _dir) = temp_path();
        let store = JsonlMessageStore::new(&path).unwrap();
        store.create(Message::new_user_turn("m1", "c1", "q1")).await.unwrap();
        store.create(Message::new_user_turn("m2", "c2", "q2")).await.unwrap();
        store.create(Message::new_user_turn("m3", "c1", "q3")).await.unwrap();

        let messages = store.list_for_chat("c1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, "m1");
        assert_eq!(messages[1].message_id, "m3");
    }
}
