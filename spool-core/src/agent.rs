// ABOUTME: Seam between the conversation router and whatever produces replies (an agent loop, a bot).
// ABOUTME: EchoAgent is the built-in runner used by the local runtime and tests.

use crate::conversation::StoredMessage;
use crate::event::InboundEvent;
use anyhow::Result;
use async_trait::async_trait;

/// Everything a runner gets for one inbound event
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub event: InboundEvent,
    /// Recent conversation history, oldest first, including the inbound message itself
    pub history: Vec<StoredMessage>,
}

/// Produces the reply text for an inbound event.
///
/// Runners are invoked at most once per inbound event id unless a previous
/// attempt was abandoned; an `Err` is cached as the event's reply.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Runner name for logging
    fn name(&self) -> &'static str;

    async fn run(&self, request: AgentRequest) -> Result<String>;
}

/// Replies with `echo:<content>`
#[derive(Debug, Default, Clone)]
pub struct EchoAgent;

#[async_trait]
impl AgentRunner for EchoAgent {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run(&self, request: AgentRequest) -> Result<String> {
        Ok(format!("echo:{}", request.event.content))
    }
}
