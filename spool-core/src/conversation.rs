// ABOUTME: Conversation records and message history for each (channel, chat_id).
// ABOUTME: Messages are keyed by id and written insert-or-ignore so redelivery never duplicates history.

use crate::db::{lock, parse_column};
use crate::event::ConversationKey;
use crate::time::{from_millis, to_millis};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => anyhow::bail!("Unknown message role: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub role: Role,
    pub sender: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub channel: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConversationStore {
    db: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Create the chat record if missing and bump its last activity
    pub fn touch_chat(&self, key: &ConversationKey, at: DateTime<Utc>) -> Result<()> {
        let conn = lock(&self.db)?;
        conn.execute(
            "INSERT INTO chats (channel, chat_id, created_at, last_message_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (channel, chat_id) DO UPDATE
             SET last_message_at = MAX(last_message_at, excluded.last_message_at)",
            params![key.channel, key.chat_id, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, key: &ConversationKey) -> Result<Option<ChatRecord>> {
        let conn = lock(&self.db)?;
        let chat = conn
            .query_row(
                "SELECT channel, chat_id, created_at, last_message_at
                 FROM chats WHERE channel = ?1 AND chat_id = ?2",
                params![key.channel, key.chat_id],
                |row| {
                    Ok(ChatRecord {
                        channel: row.get(0)?,
                        chat_id: row.get(1)?,
                        created_at: from_millis(row.get(2)?),
                        last_message_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()?;
        Ok(chat)
    }

    /// Append a message. Returns false when a message with this id is already stored.
    pub fn append_message(&self, key: &ConversationKey, msg: &StoredMessage) -> Result<bool> {
        let conn = lock(&self.db)?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO messages
                (channel, chat_id, message_id, role, sender, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.channel,
                key.chat_id,
                msg.message_id,
                msg.role.as_str(),
                msg.sender,
                msg.content,
                to_millis(msg.created_at),
            ],
        )?;
        Ok(rows == 1)
    }

    /// Most recent `limit` messages, oldest first
    pub fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(
            "SELECT message_id, role, sender, content, created_at
             FROM messages
             WHERE channel = ?1 AND chat_id = ?2
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3",
        )?;
        let mut messages = stmt
            .query_map(params![key.channel, key.chat_id, limit as i64], |row| {
                Ok(StoredMessage {
                    message_id: row.get(0)?,
                    role: parse_column(1, row.get(1)?)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    created_at: from_millis(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn count_messages(&self, key: &ConversationKey) -> Result<u64> {
        let conn = lock(&self.db)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel = ?1 AND chat_id = ?2",
            params![key.channel, key.chat_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
