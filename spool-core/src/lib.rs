// ABOUTME: Durable event delivery core for an agent runtime.
// ABOUTME: SQLite-backed queue, message bus with flow control, execution ledger, router, and scheduler.

pub mod agent;
pub mod bus;
pub mod config;
pub mod conversation;
pub mod db;
pub mod event;
pub mod ledger;
pub mod metrics;
pub mod paths;
pub mod queue;
pub mod rate_limit;
pub mod router;
pub mod scheduler;
pub mod serial;
pub mod tasks;
pub mod time;

pub use agent::{AgentRequest, AgentRunner, EchoAgent};
pub use bus::{Admission, InboundHandler, MessageBus, OutboundHandler, PublishOutcome};
pub use config::Config;
pub use db::Database;
pub use event::{ConversationKey, Direction, Envelope, InboundEvent, OutboundEvent};
pub use queue::{QueueMessage, QueueStatus, QueueStore};
pub use router::{ConversationRouter, RouteOutcome};
pub use scheduler::Scheduler;
pub use tasks::{ScheduleType, ScheduledTask, TaskStatus, TaskStore};
