// ABOUTME: Execution ledger keyed by (channel, chat_id, inbound_id) that makes handler runs idempotent.
// ABOUTME: A completed entry's cached result is authoritative; a stale running entry may be reclaimed.

use crate::db::{lock, parse_column};
use crate::event::ConversationKey;
use crate::time::{from_millis, from_millis_opt, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Running,
    Completed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Running => "running",
            LedgerStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LedgerStatus::Running),
            "completed" => Ok(LedgerStatus::Completed),
            _ => anyhow::bail!("Unknown ledger status: {}", s),
        }
    }
}

/// How a handler run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Error,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Error => "error",
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "error" => Ok(RunOutcome::Error),
            _ => anyhow::bail!("Unknown run outcome: {}", s),
        }
    }
}

/// Result cached on a completed ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Reply content published for the inbound event. Errors are carried here as text too.
    pub reply: String,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(reply: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            reply: reply.into(),
            outcome: RunOutcome::Success,
            duration_ms,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            reply: format!("error: {}", error),
            outcome: RunOutcome::Error,
            duration_ms,
            error: Some(error),
        }
    }
}

/// What the caller should do after consulting the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerDecision {
    /// No prior entry; a `running` entry now belongs to the caller
    Started,
    /// A stale `running` entry was taken over by the caller
    Reclaimed,
    /// Already done; reuse the cached result without invoking the handler
    Completed(ExecutionResult),
    /// Another attempt holds a fresh `running` entry
    InFlight,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub channel: String,
    pub chat_id: String,
    pub inbound_id: String,
    pub status: LedgerStatus,
    pub cached_result: Option<ExecutionResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Try to take ownership of running `inbound_id`.
    ///
    /// A `running` entry last touched at or before `stale_before` is treated as
    /// abandoned by a crashed or hung attempt and is reclaimed.
    pub fn begin(
        &self,
        key: &ConversationKey,
        inbound_id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<LedgerDecision> {
        let mut conn = lock(&self.db)?;
        let tx = conn.transaction()?;
        let now_ms = to_millis(now);

        let created = tx.execute(
            "INSERT OR IGNORE INTO execution_ledger
                (channel, chat_id, inbound_id, status, started_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?4)",
            params![key.channel, key.chat_id, inbound_id, now_ms],
        )?;
        if created == 1 {
            tx.commit().context("Failed to commit ledger entry")?;
            return Ok(LedgerDecision::Started);
        }

        let (status, cached, updated_at): (String, Option<String>, i64) = tx.query_row(
            "SELECT status, cached_result, updated_at FROM execution_ledger
             WHERE channel = ?1 AND chat_id = ?2 AND inbound_id = ?3",
            params![key.channel, key.chat_id, inbound_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if status.parse::<LedgerStatus>()? == LedgerStatus::Completed {
            if let Some(result) = cached.as_deref().and_then(|c| serde_json::from_str(c).ok()) {
                return Ok(LedgerDecision::Completed(result));
            }
            tracing::warn!(
                inbound_id = %inbound_id,
                "Completed ledger entry has unreadable cached result, re-running"
            );
        } else if updated_at > to_millis(stale_before) {
            return Ok(LedgerDecision::InFlight);
        }

        let reclaimed = tx.execute(
            "UPDATE execution_ledger
             SET status = 'running', cached_result = NULL, completed_at = NULL,
                 started_at = ?4, updated_at = ?4
             WHERE channel = ?1 AND chat_id = ?2 AND inbound_id = ?3 AND updated_at = ?5",
            params![key.channel, key.chat_id, inbound_id, now_ms, updated_at],
        )?;
        tx.commit().context("Failed to commit ledger reclaim")?;
        if reclaimed == 1 {
            tracing::warn!(
                conversation = %key,
                inbound_id = %inbound_id,
                "Reclaimed abandoned execution"
            );
            Ok(LedgerDecision::Reclaimed)
        } else {
            Ok(LedgerDecision::InFlight)
        }
    }

    /// Finalize an entry as `completed` with its result cached
    pub fn complete(
        &self,
        key: &ConversationKey,
        inbound_id: &str,
        result: &ExecutionResult,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cached = serde_json::to_string(result).context("Failed to serialize execution result")?;
        let now_ms = to_millis(now);
        let conn = lock(&self.db)?;
        conn.execute(
            "INSERT INTO execution_ledger
                (channel, chat_id, inbound_id, status, cached_result, started_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, 'completed', ?4, ?5, ?5, ?5)
             ON CONFLICT (channel, chat_id, inbound_id) DO UPDATE
             SET status = 'completed', cached_result = excluded.cached_result,
                 updated_at = excluded.updated_at, completed_at = excluded.completed_at",
            params![key.channel, key.chat_id, inbound_id, cached, now_ms],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &ConversationKey, inbound_id: &str) -> Result<Option<LedgerEntry>> {
        let conn = lock(&self.db)?;
        let entry = conn
            .query_row(
                "SELECT channel, chat_id, inbound_id, status, cached_result,
                        started_at, updated_at, completed_at
                 FROM execution_ledger
                 WHERE channel = ?1 AND chat_id = ?2 AND inbound_id = ?3",
                params![key.channel, key.chat_id, inbound_id],
                |row| {
                    let cached: Option<String> = row.get(4)?;
                    Ok(LedgerEntry {
                        channel: row.get(0)?,
                        chat_id: row.get(1)?,
                        inbound_id: row.get(2)?,
                        status: parse_column(3, row.get(3)?)?,
                        cached_result: cached.and_then(|c| serde_json::from_str(&c).ok()),
                        started_at: from_millis(row.get(5)?),
                        updated_at: from_millis(row.get(6)?),
                        completed_at: from_millis_opt(row.get(7)?),
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }
}
