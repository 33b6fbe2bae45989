// ABOUTME: Time-driven scheduler that turns due tasks into synthetic inbound events.
// ABOUTME: Computes next runs for interval/once/cron schedules and dispatches on a fixed tick.

use crate::bus::MessageBus;
use crate::config::SchedulerConfig;
use crate::event::{Direction, Envelope, InboundEvent};
use crate::metrics;
use crate::queue::NewMessage;
use crate::tasks::{
    DispatchOutcome, NewTask, ScheduleType, ScheduledTask, TaskAdvance, TaskStatus, TaskStore,
};
use crate::time::to_millis;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Upper bound on tasks dispatched per tick
const TICK_BATCH: usize = 200;

/// Sender recorded on scheduler-generated inbound events
pub const SCHEDULER_SENDER: &str = "scheduler";

/// Accepts 5-field cron (minute precision) by prepending a zero seconds field
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Next cron occurrence strictly after `after`, evaluated in `tz`
pub fn next_cron_after(expr: &str, tz: Tz, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = Schedule::from_str(&normalize_cron(expr))
        .with_context(|| format!("Invalid cron expression: {}", expr))?;
    let next_local = schedule
        .after(&after.with_timezone(&tz))
        .next()
        .with_context(|| format!("Cron expression {} has no upcoming occurrence", expr))?;
    Ok(next_local.with_timezone(&Utc))
}

fn parse_interval_ms(value: &str) -> Result<u64> {
    let ms: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid interval (expected milliseconds): {}", value))?;
    if ms == 0 {
        anyhow::bail!("Interval must be greater than zero");
    }
    Ok(ms)
}

fn parse_once(value: &str) -> Result<DateTime<Utc>> {
    let at = DateTime::parse_from_rfc3339(value.trim())
        .with_context(|| format!("Invalid once time (expected RFC 3339): {}", value))?;
    Ok(at.with_timezone(&Utc))
}

/// First run time for a schedule evaluated at `now`. Errors when the value cannot be evaluated.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Interval => {
            let ms = parse_interval_ms(value)?;
            Ok(now + Duration::milliseconds(ms as i64))
        }
        ScheduleType::Once => parse_once(value),
        ScheduleType::Cron => next_cron_after(value, tz, now),
    }
}

/// Where a task goes after firing at `now`. Recurring tasks whose schedule
/// cannot be evaluated are parked with no next run but stay active.
pub fn advance_after_run(task: &ScheduledTask, tz: Tz, now: DateTime<Utc>) -> TaskAdvance {
    match task.schedule_type {
        ScheduleType::Once => TaskAdvance {
            next_run_at: None,
            status: TaskStatus::Done,
        },
        kind => match compute_next_run(kind, &task.schedule_value, tz, now) {
            Ok(next) => TaskAdvance {
                next_run_at: Some(next),
                status: TaskStatus::Active,
            },
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    schedule = %task.schedule_value,
                    error = %e,
                    "Schedule cannot be evaluated, parking task"
                );
                TaskAdvance {
                    next_run_at: None,
                    status: TaskStatus::Active,
                }
            }
        },
    }
}

/// Synthetic inbound event for one occurrence of a task. The id is derived
/// from the occurrence so re-dispatching it collapses onto one queue row.
pub fn task_event(task: &ScheduledTask, due_at: DateTime<Utc>) -> InboundEvent {
    let mut event = InboundEvent::new(
        format!("task:{}:{}", task.id, to_millis(due_at)),
        &task.channel,
        &task.chat_id,
        SCHEDULER_SENDER,
        &task.prompt,
    );
    event.task_id = Some(task.id.clone());
    event
}

/// Validate a schedule, compute its first run, and store the task
pub fn create_task(
    store: &TaskStore,
    task: &NewTask,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<ScheduledTask> {
    let next_run_at = compute_next_run(task.schedule_type, &task.schedule_value, tz, now)?;
    store.create(task, Some(next_run_at), now)
}

/// Resume a paused or parked task, computing a fresh next run if it has none
pub fn resume_task(store: &TaskStore, id: &str, tz: Tz, now: DateTime<Utc>) -> Result<bool> {
    let Some(task) = store.get(id)? else {
        return Ok(false);
    };
    let next_run_at = if task.next_run_at.is_some() {
        None
    } else {
        Some(compute_next_run(
            task.schedule_type,
            &task.schedule_value,
            tz,
            now,
        )?)
    };
    store.resume(id, next_run_at)
}

/// Counts from one scheduler tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    tasks: TaskStore,
    bus: MessageBus,
    config: SchedulerConfig,
    tz: Tz,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(tasks: TaskStore, bus: MessageBus, config: SchedulerConfig) -> Result<Self> {
        let tz = config.tz()?;
        Ok(Self {
            tasks,
            bus,
            config,
            tz,
            running: Mutex::new(None),
        })
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Dispatch every task due at `now`. One task's failure does not stop the rest.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.tasks.list_due(now, TICK_BATCH)?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for task in due {
            match self.dispatch(&task, now) {
                Ok(DispatchOutcome::Dispatched { queue_id, inserted }) => {
                    report.dispatched += 1;
                    metrics::record_schedule_dispatched();
                    tracing::info!(
                        task_id = %task.id,
                        queue_id = %queue_id,
                        inserted,
                        "Scheduled task dispatched"
                    );
                }
                Ok(DispatchOutcome::Skipped) => {
                    report.skipped += 1;
                    tracing::debug!(task_id = %task.id, "Task no longer due, skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(task_id = %task.id, error = %e, "Failed to dispatch task");
                }
            }
        }

        if report.dispatched > 0 {
            self.bus.wake(Direction::Inbound);
        }
        Ok(report)
    }

    fn dispatch(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let due_at = task.next_run_at.unwrap_or(now);
        let envelope = Envelope::Inbound(task_event(task, due_at));
        let message = NewMessage::new(
            Direction::Inbound,
            envelope.encode()?,
            self.bus.config().max_attempts,
        )
        .with_key(envelope.idempotency_key());
        let advance = advance_after_run(task, self.tz, now);
        self.tasks.dispatch(&task.id, &advance, &message, now)
    }

    /// Spawn the tick loop. A second call while running is a no-op.
    pub fn start(self: &std::sync::Arc<Self>) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|e| anyhow::anyhow!("Scheduler lifecycle mutex poisoned: {}", e))?;
        if running.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let scheduler = self.clone();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown).await });
        *running = Some((token, handle));
        Ok(())
    }

    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(e) => {
                tracing::error!(error = %e, "Scheduler lifecycle mutex poisoned");
                return;
            }
        };
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler loop ended abnormally");
            }
            tracing::info!("Scheduler stopped");
        }
    }

    async fn run(&self, shutdown: CancellationToken) {
        let tick_interval = self.config.tick_interval();
        tracing::info!(
            interval_ms = self.config.tick_interval_ms,
            timezone = %self.tz,
            "Starting scheduler"
        );

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick(Utc::now()) {
                Ok(report) if report.due > 0 => {
                    tracing::info!(
                        due = report.due,
                        dispatched = report.dispatched,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Scheduler tick"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_cron_gets_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("30 0 9 * * *"), "30 0 9 * * *");
    }

    #[test]
    fn test_next_cron_respects_timezone() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        // 09:00 in Chicago (UTC-6 in January) is 15:00 UTC
        let next = next_cron_after("0 9 * * *", chrono_tz::America::Chicago, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_compute_next_run_by_kind() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let tz = chrono_tz::UTC;
        assert_eq!(
            compute_next_run(ScheduleType::Interval, "60000", tz, now).unwrap(),
            now + Duration::minutes(1)
        );
        assert_eq!(
            compute_next_run(ScheduleType::Once, "2024-02-01T08:00:00Z", tz, now).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
        );
        assert!(compute_next_run(ScheduleType::Interval, "0", tz, now).is_err());
        assert!(compute_next_run(ScheduleType::Cron, "not a cron", tz, now).is_err());
        assert!(compute_next_run(ScheduleType::Once, "tomorrow", tz, now).is_err());
    }

    #[test]
    fn test_advance_parks_unevaluable_cron_and_finishes_once() {
        let now = Utc::now();
        let mut task = ScheduledTask {
            id: "t1".to_string(),
            owner_key: "cli:c1".to_string(),
            channel: "cli".to_string(),
            chat_id: "c1".to_string(),
            prompt: "ping".to_string(),
            schedule_type: ScheduleType::Cron,
            schedule_value: "bogus".to_string(),
            status: TaskStatus::Active,
            next_run_at: Some(now),
            last_run_at: None,
            created_at: now,
        };
        let parked = advance_after_run(&task, chrono_tz::UTC, now);
        assert_eq!(parked.next_run_at, None);
        assert_eq!(parked.status, TaskStatus::Active);

        task.schedule_type = ScheduleType::Once;
        let done = advance_after_run(&task, chrono_tz::UTC, now);
        assert_eq!(done.status, TaskStatus::Done);
    }

    #[test]
    fn test_task_event_id_is_stable_per_occurrence() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let task = ScheduledTask {
            id: "t1".to_string(),
            owner_key: "cli:c1".to_string(),
            channel: "cli".to_string(),
            chat_id: "c1".to_string(),
            prompt: "ping".to_string(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "1000".to_string(),
            status: TaskStatus::Active,
            next_run_at: Some(now),
            last_run_at: None,
            created_at: now,
        };
        let a = task_event(&task, now);
        let b = task_event(&task, now);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id, format!("task:t1:{}", now.timestamp_millis()));
        assert_eq!(a.task_id.as_deref(), Some("t1"));
        assert_eq!(a.sender, SCHEDULER_SENDER);
    }
}
