//! Durable per-conversation message log.
//!
//! Every turn replaces the whole history at once; there are no partial
//! appends, so a failed turn never leaves half-written state behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gate_llm::{ConversationId, Message, ToolCallId};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("conversation {conversation_id} is unreadable: {reason}")]
    Corrupt {
        conversation_id: String,
        reason: String,
    },

    #[error("store task failed: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub message_count: usize,
    pub pending_tool_call_id: Option<ToolCallId>,
    /// Set once an invariant violation was detected; cleared only by deletion.
    pub inconsistent: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSummary {
    fn from_history(
        conversation_id: ConversationId,
        messages: &[Message],
        inconsistent: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            message_count: messages.len(),
            pending_tool_call_id: pending_call(messages),
            inconsistent,
            updated_at,
        }
    }
}

/// The most recent unresolved tool call, if any.
pub fn pending_call(messages: &[Message]) -> Option<ToolCallId> {
    messages
        .iter()
        .flat_map(Message::tool_invocations)
        .filter(|inv| !inv.is_terminal())
        .last()
        .map(|inv| inv.tool_call_id().clone())
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Ordered history; empty for an unknown conversation.
    async fn load(&self, id: &ConversationId) -> StoreResult<Vec<Message>>;

    /// Atomically replaces the whole history.
    async fn replace(&self, id: &ConversationId, messages: &[Message]) -> StoreResult<()>;

    /// Returns whether anything was deleted.
    async fn delete(&self, id: &ConversationId) -> StoreResult<bool>;

    /// Most recently updated first.
    async fn list(&self) -> StoreResult<Vec<ConversationSummary>>;

    async fn mark_inconsistent(&self, id: &ConversationId, reason: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
struct StoredConversation {
    messages: Vec<Message>,
    inconsistent: Option<String>,
    updated_at: DateTime<Utc>,
}

impl StoredConversation {
    fn empty() -> Self {
        Self {
            messages: Vec::new(),
            inconsistent: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, StoredConversation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<Vec<Message>> {
        Ok(self
            .conversations
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default())
    }

    async fn replace(&self, id: &ConversationId, messages: &[Message]) -> StoreResult<()> {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(StoredConversation::empty);
        entry.messages = messages.to_vec();
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<bool> {
        Ok(self.conversations.remove(id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        let mut out: Vec<ConversationSummary> = self
            .conversations
            .iter()
            .map(|entry| {
                let (id, c) = entry.pair();
                ConversationSummary::from_history(
                    id.clone(),
                    &c.messages,
                    c.inconsistent.clone(),
                    c.updated_at,
                )
            })
            .collect();
        out.sort_by_key(|s| s.updated_at);
        out.reverse();
        Ok(out)
    }

    async fn mark_inconsistent(&self, id: &ConversationId, reason: &str) -> StoreResult<()> {
        let mut entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(StoredConversation::empty);
        entry.inconsistent = Some(reason.to_string());
        Ok(())
    }
}

/// One row per conversation; the history column holds the JSON-encoded
/// message list.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let path = path.to_path_buf();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> StoreResult<Connection> {
            if let Some(parent) = open_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("create store dir {}: {e}", parent.display()))
                })?;
            }
            let conn = Connection::open(&open_path).map_err(|e| {
                StoreError::Backend(format!("open store {}: {e}", open_path.display()))
            })?;
            conn.busy_timeout(Duration::from_millis(2000))?;
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS toolgate_conversations (
    conversation_id TEXT PRIMARY KEY,
    history_json TEXT NOT NULL,
    inconsistent TEXT NULL,
    updated_at TEXT NOT NULL
);
"#,
            )?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        tracing::info!(path = %path.display(), "sqlite message store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn decode_history(conversation_id: &str, json: &str) -> StoreResult<Vec<Message>> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        conversation_id: conversation_id.to_string(),
        reason: e.to_string(),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<Vec<Message>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let row: Option<String> = conn
                .query_row(
                    "SELECT history_json FROM toolgate_conversations WHERE conversation_id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match row {
                Some(json) => decode_history(id.as_str(), &json),
                None => Ok(Vec::new()),
            }
        })
        .await
    }

    async fn replace(&self, id: &ConversationId, messages: &[Message]) -> StoreResult<()> {
        let id = id.clone();
        let json = serde_json::to_string(messages)
            .map_err(|e| StoreError::Backend(format!("encode history: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO toolgate_conversations (conversation_id, history_json, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(conversation_id) DO UPDATE SET
    history_json = excluded.history_json,
    updated_at = excluded.updated_at
"#,
                params![id.as_str(), json, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<bool> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM toolgate_conversations WHERE conversation_id = ?1",
                params![id.as_str()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                r#"
SELECT conversation_id, history_json, inconsistent, updated_at
  FROM toolgate_conversations
 ORDER BY updated_at DESC
"#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, json, inconsistent, updated_at) = row?;
                let messages = decode_history(&id, &json)?;
                out.push(ConversationSummary::from_history(
                    ConversationId::from(id),
                    &messages,
                    inconsistent,
                    parse_timestamp(&updated_at),
                ));
            }
            Ok(out)
        })
        .await
    }

    async fn mark_inconsistent(&self, id: &ConversationId, reason: &str) -> StoreResult<()> {
        let id = id.clone();
        let reason = reason.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO toolgate_conversations (conversation_id, history_json, inconsistent, updated_at)
VALUES (?1, '[]', ?2, ?3)
ON CONFLICT(conversation_id) DO UPDATE SET inconsistent = excluded.inconsistent
"#,
                params![id.as_str(), reason, now],
            )?;
            Ok(())
        })
        .await
    }
}
