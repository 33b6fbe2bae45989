// ABOUTME: Conversation router: the inbound handler that runs the agent once per inbound event.
// ABOUTME: Serializes work per conversation and consults the execution ledger before every run.

use crate::agent::{AgentRequest, AgentRunner};
use crate::bus::{InboundHandler, MessageBus};
use crate::config::RouterConfig;
use crate::conversation::{ConversationStore, Role, StoredMessage};
use crate::event::{ConversationKey, InboundEvent, OutboundEvent};
use crate::ledger::{ExecutionResult, LedgerDecision, LedgerStore};
use crate::metrics;
use crate::serial::KeyedSerialQueue;
use crate::tasks::{NewTaskRun, TaskStore};
use crate::time::preview;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Instant;

const RUN_PREVIEW_CHARS: usize = 200;

/// What the router did with one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The agent ran and its result was recorded
    Executed(ExecutionResult),
    /// A completed ledger entry was reused; the agent was not invoked
    Cached(ExecutionResult),
    /// Another attempt is still running this event
    SkippedInFlight,
}

pub struct ConversationRouter {
    bus: MessageBus,
    ledger: LedgerStore,
    conversations: ConversationStore,
    tasks: TaskStore,
    agent: Arc<dyn AgentRunner>,
    serial: KeyedSerialQueue<ConversationKey>,
    history_limit: usize,
}

impl ConversationRouter {
    pub fn new(
        bus: MessageBus,
        db: Arc<Mutex<Connection>>,
        agent: Arc<dyn AgentRunner>,
        config: &RouterConfig,
    ) -> Self {
        Self {
            bus,
            ledger: LedgerStore::new(db.clone()),
            conversations: ConversationStore::new(db.clone()),
            tasks: TaskStore::new(db),
            agent,
            serial: KeyedSerialQueue::new(config.idle_evict_after(), config.max_tracked_keys),
            history_limit: config.history_limit,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Drop serial-queue slots for conversations idle past the eviction window
    pub fn evict_idle(&self) -> usize {
        self.serial.evict_idle()
    }

    pub fn tracked_conversations(&self) -> usize {
        self.serial.len()
    }

    /// Handle one inbound event. Events for the same conversation are handled
    /// strictly one after another, in arrival order.
    pub async fn route(&self, event: InboundEvent) -> Result<RouteOutcome> {
        let key = event.conversation_key();
        let _turn = self.serial.acquire(&key).await;

        self.conversations.touch_chat(&key, event.timestamp)?;

        let now = Utc::now();
        let stale_before =
            now - Duration::milliseconds(self.bus.config().processing_timeout_ms as i64);

        match self.ledger.begin(&key, &event.id, stale_before, now)? {
            LedgerDecision::InFlight => {
                tracing::info!(
                    conversation = %key,
                    inbound_id = %event.id,
                    "Execution already in flight, skipping duplicate delivery"
                );
                Ok(RouteOutcome::SkippedInFlight)
            }
            LedgerDecision::Completed(result) => {
                metrics::record_ledger_cache_hit();
                tracing::debug!(
                    conversation = %key,
                    inbound_id = %event.id,
                    "Reusing cached execution result"
                );
                self.publish_result(&key, &event, &result)?;
                Ok(RouteOutcome::Cached(result))
            }
            LedgerDecision::Started | LedgerDecision::Reclaimed => {
                let result = self.execute(&key, &event).await?;
                self.ledger.complete(&key, &event.id, &result, Utc::now())?;
                self.publish_result(&key, &event, &result)?;
                Ok(RouteOutcome::Executed(result))
            }
        }
    }

    async fn execute(&self, key: &ConversationKey, event: &InboundEvent) -> Result<ExecutionResult> {
        self.append_user_message(key, event)?;
        let history = self.conversations.recent_messages(key, self.history_limit)?;

        let started = Instant::now();
        let outcome = self
            .agent
            .run(AgentRequest {
                event: event.clone(),
                history,
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(match outcome {
            Ok(reply) => {
                tracing::info!(
                    conversation = %key,
                    inbound_id = %event.id,
                    agent = self.agent.name(),
                    duration_ms,
                    "Agent run completed"
                );
                ExecutionResult::success(reply, duration_ms)
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %key,
                    inbound_id = %event.id,
                    agent = self.agent.name(),
                    error = %e,
                    "Agent run failed, caching error as reply"
                );
                ExecutionResult::failure(format!("{:#}", e), duration_ms)
            }
        })
    }

    fn append_user_message(&self, key: &ConversationKey, event: &InboundEvent) -> Result<()> {
        self.conversations.append_message(
            key,
            &StoredMessage {
                message_id: event.id.clone(),
                role: Role::User,
                sender: event.sender.clone(),
                content: event.content.clone(),
                created_at: event.timestamp,
            },
        )?;
        Ok(())
    }

    /// Side effects of a finished execution. Every step is idempotent, so a
    /// redelivered event replays them without duplicating anything.
    fn publish_result(
        &self,
        key: &ConversationKey,
        event: &InboundEvent,
        result: &ExecutionResult,
    ) -> Result<()> {
        let reply = OutboundEvent::reply(event, &result.reply);

        self.append_user_message(key, event)?;
        self.conversations.append_message(
            key,
            &StoredMessage {
                message_id: reply.id.clone(),
                role: Role::Assistant,
                sender: self.agent.name().to_string(),
                content: reply.content.clone(),
                created_at: reply.timestamp,
            },
        )?;
        self.conversations.touch_chat(key, reply.timestamp)?;

        let published = self.bus.publish_outbound(reply)?;
        tracing::debug!(
            conversation = %key,
            inbound_id = %event.id,
            queue_id = %published.queue_id,
            admission = ?published.admission,
            "Reply published"
        );

        if let Some(task_id) = event.task_id.as_deref() {
            let logged = self.tasks.log_task_run(&NewTaskRun {
                task_id: task_id.to_string(),
                inbound_id: event.id.clone(),
                ran_at: Utc::now(),
                duration_ms: result.duration_ms,
                outcome: result.outcome,
                preview: Some(preview(&result.reply, RUN_PREVIEW_CHARS)),
                error: result.error.clone(),
            })?;
            if logged {
                tracing::info!(task_id = %task_id, inbound_id = %event.id, "Task run logged");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for ConversationRouter {
    async fn handle_inbound(&self, event: InboundEvent) -> Result<()> {
        self.route(event).await.map(|_| ())
    }
}
