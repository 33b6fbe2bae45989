// ABOUTME: Durable queue store: queue rows with a status state machine plus the idempotency index.
// ABOUTME: Every mutation is a single conditional UPDATE or one short transaction on the shared connection.

use crate::db::{lock, parse_column};
use crate::event::Direction;
use crate::time::{from_millis, from_millis_opt, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Lifecycle of a queue row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "processed" => Ok(QueueStatus::Processed),
            "dead_letter" => Ok(QueueStatus::DeadLetter),
            _ => anyhow::bail!("Unknown queue status: {}", s),
        }
    }
}

/// A persisted queue row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub direction: Direction,
    pub payload: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Error that put the row in dead-letter before its most recent replay
    pub previous_error: Option<String>,
    pub replay_count: u32,
    pub replayed_at: Option<DateTime<Utc>>,
}

/// A message to be enqueued
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: Direction,
    pub payload: String,
    pub max_attempts: u32,
    /// Earliest dispatch time; `None` or anything before now means "now"
    pub available_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl NewMessage {
    pub fn new(direction: Direction, payload: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            direction,
            payload: payload.into(),
            max_attempts,
            available_at: None,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queue_id: String,
    /// False when the idempotency key was already bound to an existing row
    pub inserted: bool,
    pub status: QueueStatus,
}

/// Counts from a stale-processing scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub dead_lettered: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered
    }
}

/// Result of an operator replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub ids: Vec<String>,
}

/// Row counts grouped by direction and status
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub rows: Vec<StatusCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub direction: Direction,
    pub status: QueueStatus,
    pub count: u64,
}

impl QueueStats {
    pub fn count(&self, direction: Direction, status: QueueStatus) -> u64 {
        self.rows
            .iter()
            .filter(|r| r.direction == direction && r.status == status)
            .map(|r| r.count)
            .sum()
    }
}

/// Outcome of inserting inside a caller-owned transaction
pub(crate) enum Insertion {
    Inserted(EnqueueOutcome),
    Existing(EnqueueOutcome),
    /// The key was bound by someone else between lookup and insert; the
    /// transaction must be rolled back and the winner re-read.
    LostRace,
}

const COLUMNS: &str = "id, direction, payload, status, attempts, max_attempts, available_at,
    created_at, updated_at, claimed_at, processed_at, dead_lettered_at, last_error,
    previous_error, replay_count, replayed_at";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<QueueMessage> {
    Ok(QueueMessage {
        id: row.get(0)?,
        direction: parse_column(1, row.get(1)?)?,
        payload: row.get(2)?,
        status: parse_column(3, row.get(3)?)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        available_at: from_millis(row.get(6)?),
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
        claimed_at: from_millis_opt(row.get(9)?),
        processed_at: from_millis_opt(row.get(10)?),
        dead_lettered_at: from_millis_opt(row.get(11)?),
        last_error: row.get(12)?,
        previous_error: row.get(13)?,
        replay_count: row.get(14)?,
        replayed_at: from_millis_opt(row.get(15)?),
    })
}

fn lookup_binding(
    conn: &Connection,
    direction: Direction,
    key: &str,
) -> Result<Option<EnqueueOutcome>> {
    let found = conn
        .query_row(
            "SELECT d.queue_id, q.status
             FROM queue_dedupe d JOIN queue q ON q.id = d.queue_id
             WHERE d.direction = ?1 AND d.idempotency_key = ?2",
            params![direction.as_str(), key],
            |row| {
                Ok(EnqueueOutcome {
                    queue_id: row.get(0)?,
                    inserted: false,
                    status: parse_column(1, row.get(1)?)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}

/// Insert a queue row (and its idempotency binding) inside an open transaction.
/// Shared by `QueueStore::enqueue` and the scheduler's dispatch transaction.
pub(crate) fn insert_in_tx(
    tx: &Transaction<'_>,
    msg: &NewMessage,
    status: QueueStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Insertion> {
    if let Some(key) = msg.idempotency_key.as_deref() {
        if let Some(existing) = lookup_binding(tx, msg.direction, key)? {
            return Ok(Insertion::Existing(existing));
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now_ms = to_millis(now);
    let available_ms = msg.available_at.map(to_millis).unwrap_or(now_ms).max(now_ms);
    let dead_lettered_at = (status == QueueStatus::DeadLetter).then_some(now_ms);

    tx.execute(
        "INSERT INTO queue (id, direction, payload, status, attempts, max_attempts,
                            available_at, created_at, updated_at, dead_lettered_at, last_error)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?7, ?8, ?9)",
        params![
            id,
            msg.direction.as_str(),
            msg.payload,
            status.as_str(),
            msg.max_attempts.max(1),
            available_ms,
            now_ms,
            dead_lettered_at,
            reason,
        ],
    )?;

    if let Some(key) = msg.idempotency_key.as_deref() {
        let bound = tx.execute(
            "INSERT OR IGNORE INTO queue_dedupe (direction, idempotency_key, queue_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![msg.direction.as_str(), key, id, now_ms],
        )?;
        if bound == 0 {
            return Ok(Insertion::LostRace);
        }
    }

    Ok(Insertion::Inserted(EnqueueOutcome {
        queue_id: id,
        inserted: true,
        status,
    }))
}

/// Store for queue rows and the idempotency index
#[derive(Clone)]
pub struct QueueStore {
    db: Arc<Mutex<Connection>>,
}

impl QueueStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Enqueue a fresh `pending` row, or return the row already bound to the idempotency key
    pub fn enqueue(&self, msg: &NewMessage, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        self.insert(msg, QueueStatus::Pending, None, now)
    }

    /// Enqueue a row directly into dead-letter (flow-control rejection on arrival)
    pub fn enqueue_dead_letter(
        &self,
        msg: &NewMessage,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        self.insert(msg, QueueStatus::DeadLetter, Some(reason), now)
    }

    fn insert(
        &self,
        msg: &NewMessage,
        status: QueueStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut conn = lock(&self.db)?;
        let tx = conn.transaction()?;
        match insert_in_tx(&tx, msg, status, reason, now)? {
            Insertion::Inserted(outcome) => {
                tx.commit().context("Failed to commit enqueue")?;
                tracing::debug!(
                    queue_id = %outcome.queue_id,
                    direction = %msg.direction,
                    status = %outcome.status,
                    "Queue row inserted"
                );
                Ok(outcome)
            }
            Insertion::Existing(outcome) => {
                tracing::debug!(
                    queue_id = %outcome.queue_id,
                    direction = %msg.direction,
                    "Duplicate publish collapsed onto existing row"
                );
                Ok(outcome)
            }
            Insertion::LostRace => {
                drop(tx);
                let key = msg.idempotency_key.as_deref().unwrap_or_default();
                let winner = lookup_binding(&conn, msg.direction, key)?.with_context(|| {
                    format!("Idempotency key {} vanished after a duplicate race", key)
                })?;
                tracing::debug!(
                    queue_id = %winner.queue_id,
                    "Lost idempotency race, returning winner"
                );
                Ok(winner)
            }
        }
    }

    /// Row already bound to an idempotency key, if any
    pub fn find_by_idempotency_key(
        &self,
        direction: Direction,
        key: &str,
    ) -> Result<Option<EnqueueOutcome>> {
        let conn = lock(&self.db)?;
        lookup_binding(&conn, direction, key)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueueMessage>> {
        let conn = lock(&self.db)?;
        let msg = conn
            .query_row(
                &format!("SELECT {} FROM queue WHERE id = ?1", COLUMNS),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(msg)
    }

    /// Pending rows whose availability time has passed, oldest first
    pub fn list_due(
        &self,
        direction: Direction,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueMessage>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queue
             WHERE direction = ?1 AND status = 'pending' AND available_at <= ?2
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?3",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![direction.as_str(), to_millis(now), limit as i64],
                row_to_message,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move a row from `pending` to `processing`. Returns false if another claimant got there first.
    pub fn claim(&self, id: &str, claimed_at: DateTime<Utc>) -> Result<bool> {
        let conn = lock(&self.db)?;
        let at = to_millis(claimed_at);
        let rows = conn.execute(
            "UPDATE queue SET status = 'processing', claimed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, at],
        )?;
        Ok(rows == 1)
    }

    pub fn mark_processed(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = lock(&self.db)?;
        let at = to_millis(at);
        let rows = conn.execute(
            "UPDATE queue SET status = 'processed', processed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, at],
        )?;
        Ok(rows == 1)
    }

    pub fn mark_retry(
        &self,
        id: &str,
        attempts: u32,
        available_at: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = lock(&self.db)?;
        let rows = conn.execute(
            "UPDATE queue
             SET status = 'pending', attempts = ?2, available_at = ?3, last_error = ?4,
                 claimed_at = NULL, updated_at = ?5
             WHERE id = ?1 AND status = 'processing'",
            params![id, attempts, to_millis(available_at), error, to_millis(at)],
        )?;
        Ok(rows == 1)
    }

    pub fn mark_dead_letter(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = lock(&self.db)?;
        let at = to_millis(at);
        let rows = conn.execute(
            "UPDATE queue
             SET status = 'dead_letter', attempts = ?2, last_error = ?3,
                 dead_lettered_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, attempts, error, at],
        )?;
        Ok(rows == 1)
    }

    /// Requeue or dead-letter rows left in `processing` by a crashed or hung worker.
    /// Each stale row is charged one attempt.
    pub fn recover_stale_processing(
        &self,
        stale_before: DateTime<Utc>,
        retry_backoff_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport> {
        let mut conn = lock(&self.db)?;
        let tx = conn.transaction()?;
        let stale: Vec<(String, u32, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attempts, max_attempts FROM queue
                 WHERE status = 'processing' AND claimed_at <= ?1",
            )?;
            let rows = stmt
                .query_map(params![to_millis(stale_before)], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let now_ms = to_millis(now);
        let retry_at = to_millis(now + Duration::milliseconds(retry_backoff_ms as i64));
        let mut report = RecoveryReport::default();

        for (id, attempts, max_attempts) in stale {
            let attempts = attempts + 1;
            if attempts >= max_attempts {
                tx.execute(
                    "UPDATE queue
                     SET status = 'dead_letter', attempts = ?2,
                         last_error = 'stale processing: worker never finished',
                         dead_lettered_at = ?3, updated_at = ?3
                     WHERE id = ?1 AND status = 'processing'",
                    params![id, attempts, now_ms],
                )?;
                report.dead_lettered += 1;
                tracing::error!(queue_id = %id, attempts, "Stale processing row dead-lettered");
            } else {
                tx.execute(
                    "UPDATE queue
                     SET status = 'pending', attempts = ?2, available_at = ?3,
                         last_error = 'stale processing: requeued after restart',
                         claimed_at = NULL, updated_at = ?4
                     WHERE id = ?1 AND status = 'processing'",
                    params![id, attempts, retry_at, now_ms],
                )?;
                report.requeued += 1;
                tracing::warn!(queue_id = %id, attempts, "Stale processing row requeued");
            }
        }

        tx.commit().context("Failed to commit stale recovery")?;
        Ok(report)
    }

    /// Dead-lettered rows, most recently quarantined first
    pub fn list_dead_letter(
        &self,
        direction: Option<Direction>,
        limit: usize,
    ) -> Result<Vec<QueueMessage>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM queue
             WHERE status = 'dead_letter' AND (?1 IS NULL OR direction = ?1)
             ORDER BY dead_lettered_at DESC, rowid DESC
             LIMIT ?2",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![direction.map(|d| d.as_str()), limit as i64],
                row_to_message,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Return one dead-lettered row to `pending` with a fresh retry budget.
    /// A row in any other state is left alone and reported as `replayed = 0`.
    pub fn replay_dead_letter(&self, id: &str, now: DateTime<Utc>) -> Result<ReplayOutcome> {
        let conn = lock(&self.db)?;
        let replayed = replay_row(&conn, id, to_millis(now))?;
        Ok(ReplayOutcome {
            replayed,
            ids: if replayed > 0 {
                vec![id.to_string()]
            } else {
                Vec::new()
            },
        })
    }

    /// Replay up to `limit` dead-lettered rows, oldest quarantine first
    pub fn replay_dead_letter_batch(
        &self,
        direction: Option<Direction>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<ReplayOutcome> {
        let mut conn = lock(&self.db)?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM queue
                 WHERE status = 'dead_letter' AND (?1 IS NULL OR direction = ?1)
                 ORDER BY dead_lettered_at ASC, rowid ASC
                 LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(
                    params![direction.map(|d| d.as_str()), limit as i64],
                    |row| row.get(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let now_ms = to_millis(now);
        let mut outcome = ReplayOutcome::default();
        for id in ids {
            if replay_row(&tx, &id, now_ms)? > 0 {
                outcome.replayed += 1;
                outcome.ids.push(id);
            }
        }
        tx.commit().context("Failed to commit dead-letter replay")?;
        Ok(outcome)
    }

    /// Rows still owed work in a direction (`pending` + `processing`)
    pub fn count_active(&self, direction: Direction) -> Result<u64> {
        let conn = lock(&self.db)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue
             WHERE direction = ?1 AND status IN ('pending', 'processing')",
            params![direction.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(
            "SELECT direction, status, COUNT(*) FROM queue
             GROUP BY direction, status
             ORDER BY direction, status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StatusCount {
                    direction: parse_column(0, row.get(0)?)?,
                    status: parse_column(1, row.get(1)?)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueueStats { rows })
    }
}

fn replay_row(conn: &Connection, id: &str, now_ms: i64) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE queue
         SET status = 'pending', attempts = 0, available_at = ?2, updated_at = ?2,
             previous_error = last_error, last_error = NULL,
             dead_lettered_at = NULL, claimed_at = NULL, processed_at = NULL,
             replay_count = replay_count + 1, replayed_at = ?2
         WHERE id = ?1 AND status = 'dead_letter'",
        params![id, now_ms],
    )?;
    Ok(rows)
}
