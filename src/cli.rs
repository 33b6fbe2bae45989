// ABOUTME: Command-line surface: run the delivery loops, publish events, and operate queues and tasks.
// ABOUTME: Read-only and operator commands open the workspace database without starting any loops.

use crate::runtime::Runtime;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use spool_core::config::Config;
use spool_core::event::{Direction, InboundEvent};
use spool_core::queue::QueueStatus;
use spool_core::scheduler;
use spool_core::tasks::{NewTask, ScheduleType};

#[derive(Parser, Debug)]
#[command(name = "spool")]
#[command(about = "Durable event delivery for an agent runtime", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bus, router, and scheduler until Ctrl-C
    Run,
    /// Enqueue one inbound event; it is processed by the next `run`
    Publish(PublishArgs),
    /// Show queue row counts by direction and status
    Stats,
    /// Inspect and replay dead-lettered rows
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
    /// Manage scheduled tasks
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    #[arg(long, default_value = "cli")]
    pub channel: String,
    #[arg(long)]
    pub chat: String,
    #[arg(long, default_value = "operator")]
    pub sender: String,
    /// Event id; defaults to a fresh UUID
    #[arg(long)]
    pub id: Option<String>,
    pub content: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    Inbound,
    Outbound,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Inbound => Direction::Inbound,
            DirectionArg::Outbound => Direction::Outbound,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum DeadLetterCommand {
    List {
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Move one dead-lettered row back to pending
    Replay { id: String },
    /// Move up to `limit` dead-lettered rows back to pending, oldest first
    ReplayBatch {
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ScheduleKind {
    /// Value is a period in milliseconds
    Interval,
    /// Value is an RFC 3339 timestamp
    Once,
    /// Value is a 5- or 6-field cron expression
    Cron,
}

impl From<ScheduleKind> for ScheduleType {
    fn from(kind: ScheduleKind) -> Self {
        match kind {
            ScheduleKind::Interval => ScheduleType::Interval,
            ScheduleKind::Once => ScheduleType::Once,
            ScheduleKind::Cron => ScheduleType::Cron,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Add {
        #[arg(long, default_value = "cli")]
        channel: String,
        #[arg(long)]
        chat: String,
        #[arg(long, value_enum)]
        kind: ScheduleKind,
        #[arg(long)]
        value: String,
        prompt: String,
    },
    List {
        /// Only tasks owned by this `channel:chat_id`
        #[arg(long)]
        owner: Option<String>,
    },
    Pause { id: String },
    Resume { id: String },
    Cancel { id: String },
    Runs {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let runtime = Runtime::open(config)?;

    match cli.command {
        Command::Run => runtime.run_until_ctrl_c().await,
        Command::Publish(args) => publish(&runtime, args),
        Command::Stats => stats(&runtime),
        Command::DeadLetter(cmd) => dead_letter(&runtime, cmd),
        Command::Task(cmd) => task(&runtime, cmd),
    }
}

fn publish(runtime: &Runtime, args: PublishArgs) -> Result<()> {
    let id = args
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let event = InboundEvent::new(id, args.channel, args.chat, args.sender, args.content);
    let outcome = runtime.bus.publish_inbound(event)?;
    println!(
        "{} {} ({:?})",
        outcome.queue_id, outcome.status, outcome.admission
    );
    Ok(())
}

fn stats(runtime: &Runtime) -> Result<()> {
    let stats = runtime.bus.stats()?;
    for direction in Direction::ALL {
        let counts: Vec<String> = [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Processed,
            QueueStatus::DeadLetter,
        ]
        .iter()
        .map(|status| format!("{}={}", status, stats.count(direction, *status)))
        .collect();
        println!("{:<9} {}", direction, counts.join(" "));
    }
    Ok(())
}

fn dead_letter(runtime: &Runtime, cmd: DeadLetterCommand) -> Result<()> {
    match cmd {
        DeadLetterCommand::List { direction, limit } => {
            let rows = runtime
                .bus
                .list_dead_letter(direction.map(Into::into), limit)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        DeadLetterCommand::Replay { id } => {
            let outcome = runtime.bus.replay_dead_letter(&id)?;
            if outcome.replayed == 0 {
                anyhow::bail!("No dead-lettered row with id {}", id);
            }
            println!("replayed {}", id);
        }
        DeadLetterCommand::ReplayBatch { direction, limit } => {
            let outcome = runtime
                .bus
                .replay_dead_letter_batch(direction.map(Into::into), limit)?;
            println!("replayed {}", outcome.replayed);
        }
    }
    Ok(())
}

fn task(runtime: &Runtime, cmd: TaskCommand) -> Result<()> {
    let tasks = runtime.scheduler.tasks();
    let tz = runtime.config.scheduler.tz()?;

    match cmd {
        TaskCommand::Add {
            channel,
            chat,
            kind,
            value,
            prompt,
        } => {
            let new_task = NewTask {
                channel,
                chat_id: chat,
                prompt,
                schedule_type: kind.into(),
                schedule_value: value,
            };
            let created = scheduler::create_task(tasks, &new_task, tz, Utc::now())
                .context("Failed to create task")?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
        TaskCommand::List { owner } => {
            let list = match owner {
                Some(owner) => tasks.list_by_owner(&owner)?,
                None => tasks.list()?,
            };
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        TaskCommand::Pause { id } => report_change("paused", &id, tasks.pause(&id)?)?,
        TaskCommand::Resume { id } => {
            let resumed = scheduler::resume_task(tasks, &id, tz, Utc::now())?;
            report_change("resumed", &id, resumed)?;
        }
        TaskCommand::Cancel { id } => report_change("cancelled", &id, tasks.cancel(&id)?)?,
        TaskCommand::Runs { id, limit } => {
            let runs = tasks.list_runs(&id, limit)?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
    }
    Ok(())
}

fn report_change(verb: &str, id: &str, changed: bool) -> Result<()> {
    if !changed {
        anyhow::bail!("Task {} was not {} (missing or in the wrong state)", id, verb);
    }
    println!("{} {}", verb, id);
    Ok(())
}
