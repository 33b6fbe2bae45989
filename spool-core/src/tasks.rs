// ABOUTME: Scheduled task storage and the append-only task-run log.
// ABOUTME: Dispatch advances a due task and enqueues its synthetic inbound event in one transaction.

use crate::db::{lock, parse_column};
use crate::event::ConversationKey;
use crate::ledger::RunOutcome;
use crate::queue::{insert_in_tx, Insertion, NewMessage, QueueStatus};
use crate::time::{from_millis, from_millis_opt, to_millis};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Fixed period in milliseconds
    Interval,
    /// Single RFC 3339 instant
    Once,
    /// Cron expression, 5 to 7 fields
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
            ScheduleType::Cron => "cron",
        }
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(ScheduleType::Interval),
            "once" => Ok(ScheduleType::Once),
            "cron" => Ok(ScheduleType::Cron),
            _ => anyhow::bail!("Unknown schedule type: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "done" => Ok(TaskStatus::Done),
            _ => anyhow::bail!("Unknown task status: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Conversation that owns the task, `channel:chat_id`
    pub owner_key: String,
    pub channel: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub status: TaskStatus,
    /// None while parked (finished once-task or unevaluable cron)
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.channel, &self.chat_id)
    }
}

/// Input for creating a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub channel: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
}

/// State a task moves to when dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAdvance {
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task advanced and its event is queued (`inserted = false` if the event already existed)
    Dispatched { queue_id: String, inserted: bool },
    /// Task was no longer due at write time; nothing changed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: String,
    pub inbound_id: String,
    pub ran_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub preview: Option<String>,
    pub error: Option<String>,
}

/// A run to record; `id` is assigned by the store
#[derive(Debug, Clone)]
pub struct NewTaskRun {
    pub task_id: String,
    pub inbound_id: String,
    pub ran_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub preview: Option<String>,
    pub error: Option<String>,
}

const TASK_COLUMNS: &str = "id, owner_key, channel, chat_id, prompt, schedule_type,
    schedule_value, status, next_run_at, last_run_at, created_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        owner_key: row.get(1)?,
        channel: row.get(2)?,
        chat_id: row.get(3)?,
        prompt: row.get(4)?,
        schedule_type: parse_column(5, row.get(5)?)?,
        schedule_value: row.get(6)?,
        status: parse_column(7, row.get(7)?)?,
        next_run_at: from_millis_opt(row.get(8)?),
        last_run_at: from_millis_opt(row.get(9)?),
        created_at: from_millis(row.get(10)?),
    })
}

#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Insert a task with an already computed first run
    pub fn create(
        &self,
        task: &NewTask,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask> {
        if task.prompt.trim().is_empty() {
            anyhow::bail!("Task prompt cannot be empty");
        }
        if task.channel.trim().is_empty() || task.chat_id.trim().is_empty() {
            anyhow::bail!("Task channel and chat_id are required");
        }

        let created = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            owner_key: ConversationKey::new(&task.channel, &task.chat_id).to_string(),
            channel: task.channel.clone(),
            chat_id: task.chat_id.clone(),
            prompt: task.prompt.clone(),
            schedule_type: task.schedule_type,
            schedule_value: task.schedule_value.clone(),
            status: TaskStatus::Active,
            next_run_at: next_run_at.map(|at| from_millis(to_millis(at))),
            last_run_at: None,
            created_at: from_millis(to_millis(now)),
        };

        let conn = lock(&self.db)?;
        conn.execute(
            "INSERT INTO tasks (id, owner_key, channel, chat_id, prompt, schedule_type,
                                schedule_value, status, next_run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                created.id,
                created.owner_key,
                created.channel,
                created.chat_id,
                created.prompt,
                created.schedule_type.as_str(),
                created.schedule_value,
                created.status.as_str(),
                created.next_run_at.map(to_millis),
                to_millis(created.created_at),
            ],
        )
        .context("Failed to insert task")?;

        tracing::info!(
            task_id = %created.id,
            owner = %created.owner_key,
            schedule_type = %created.schedule_type,
            next_run_at = ?created.next_run_at,
            "Task created"
        );
        Ok(created)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = lock(&self.db)?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    pub fn list(&self) -> Result<Vec<ScheduledTask>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn list_by_owner(&self, owner_key: &str) -> Result<Vec<ScheduledTask>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE owner_key = ?1 ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![owner_key], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Active tasks whose next run is at or before `now`, earliest first
    pub fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks
             WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC, rowid ASC
             LIMIT ?2",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![to_millis(now), limit as i64], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn pause(&self, id: &str) -> Result<bool> {
        let conn = lock(&self.db)?;
        let rows = conn.execute(
            "UPDATE tasks SET status = 'paused' WHERE id = ?1 AND status = 'active'",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Reactivate a paused task, or a parked active one. `next_run_at` is only
    /// applied when the task has no pending run.
    pub fn resume(&self, id: &str, next_run_at: Option<DateTime<Utc>>) -> Result<bool> {
        let conn = lock(&self.db)?;
        let rows = conn.execute(
            "UPDATE tasks
             SET status = 'active', next_run_at = COALESCE(next_run_at, ?2)
             WHERE id = ?1
               AND (status = 'paused' OR (status = 'active' AND next_run_at IS NULL))",
            params![id, next_run_at.map(to_millis)],
        )?;
        Ok(rows > 0)
    }

    /// Mark a task done. Its run history is kept.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let conn = lock(&self.db)?;
        let rows = conn.execute(
            "UPDATE tasks SET status = 'done', next_run_at = NULL
             WHERE id = ?1 AND status != 'done'",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Advance a due task and enqueue its inbound event, all or nothing.
    ///
    /// The advance is conditional on the task still being active and due at
    /// `now`, so a second dispatch of the same occurrence is `Skipped`.
    pub fn dispatch(
        &self,
        task_id: &str,
        advance: &TaskAdvance,
        event: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let mut conn = lock(&self.db)?;
        let tx = conn.transaction()?;
        let now_ms = to_millis(now);

        let advanced = tx.execute(
            "UPDATE tasks
             SET next_run_at = ?2, status = ?3, last_run_at = ?4
             WHERE id = ?1 AND status = 'active'
               AND next_run_at IS NOT NULL AND next_run_at <= ?4",
            params![
                task_id,
                advance.next_run_at.map(to_millis),
                advance.status.as_str(),
                now_ms
            ],
        )?;
        if advanced == 0 {
            return Ok(DispatchOutcome::Skipped);
        }

        let outcome = match insert_in_tx(&tx, event, QueueStatus::Pending, None, now)? {
            Insertion::Inserted(o) | Insertion::Existing(o) => o,
            Insertion::LostRace => {
                tracing::warn!(task_id = %task_id, "Task event raced a concurrent insert, rolling back");
                return Ok(DispatchOutcome::Skipped);
            }
        };
        tx.commit().context("Failed to commit task dispatch")?;

        Ok(DispatchOutcome::Dispatched {
            queue_id: outcome.queue_id,
            inserted: outcome.inserted,
        })
    }

    /// Record a run. Returns false when a run for this inbound event is already logged.
    pub fn log_task_run(&self, run: &NewTaskRun) -> Result<bool> {
        let conn = lock(&self.db)?;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO task_runs
                (task_id, inbound_id, ran_at, duration_ms, outcome, preview, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.task_id,
                run.inbound_id,
                to_millis(run.ran_at),
                run.duration_ms as i64,
                run.outcome.as_str(),
                run.preview,
                run.error,
            ],
        )?;
        Ok(rows == 1)
    }

    /// Runs for one task, newest first
    pub fn list_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRun>> {
        let conn = lock(&self.db)?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, inbound_id, ran_at, duration_ms, outcome, preview, error
             FROM task_runs
             WHERE task_id = ?1
             ORDER BY ran_at DESC, id DESC
             LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![task_id, limit as i64], |row| {
                Ok(TaskRun {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    inbound_id: row.get(2)?,
                    ran_at: from_millis(row.get(3)?),
                    duration_ms: row.get::<_, i64>(4)? as u64,
                    outcome: parse_column(5, row.get(5)?)?,
                    preview: row.get(6)?,
                    error: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
