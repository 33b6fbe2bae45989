// ABOUTME: Event types carried by the bus: inbound events from producers, outbound replies to consumers.
// ABOUTME: Queue payloads are a tagged Envelope that is decoded and validated when a row is dequeued.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which processing loop a queue row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Inbound, Direction::Outbound];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            _ => anyhow::bail!("Unknown direction: {}", s),
        }
    }
}

/// Identity of one conversation: the channel it arrived on plus the chat within that channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub channel: String,
    pub chat_id: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.chat_id)
    }
}

/// An event entering the system from a producer (channel adapter, scheduler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Producer-assigned event id, unique within the conversation
    pub id: String,
    /// Which channel adapter the event came from (e.g. "cli", "webhook", "scheduler")
    pub channel: String,
    pub chat_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set when the event was injected by the scheduler for a task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl InboundEvent {
    pub fn new(
        id: impl Into<String>,
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
            task_id: None,
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.channel, &self.chat_id)
    }

    /// Key under which duplicate publishes of this event collapse to one queue row
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.channel, self.chat_id, self.id)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("inbound event has empty id");
        }
        if self.channel.trim().is_empty() || self.chat_id.trim().is_empty() {
            anyhow::bail!("inbound event {} has empty channel or chat_id", self.id);
        }
        Ok(())
    }
}

/// A reply leaving the system toward a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub id: String,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Inbound event this is a reply to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutboundEvent {
    /// Reply to an inbound event. The id is derived from the inbound id so that
    /// re-publishing the same reply collapses onto the first queue row.
    pub fn reply(inbound: &InboundEvent, content: impl Into<String>) -> Self {
        Self {
            id: format!("reply:{}", inbound.id),
            channel: inbound.channel.clone(),
            chat_id: inbound.chat_id.clone(),
            content: content.into(),
            reply_to: Some(inbound.id.clone()),
            timestamp: Utc::now(),
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.channel, &self.chat_id)
    }

    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.channel, self.chat_id, self.id)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("outbound event has empty id");
        }
        if self.channel.trim().is_empty() || self.chat_id.trim().is_empty() {
            anyhow::bail!("outbound event {} has empty channel or chat_id", self.id);
        }
        Ok(())
    }
}

/// Serialized form of a queue row's payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "lowercase")]
pub enum Envelope {
    Inbound(InboundEvent),
    Outbound(OutboundEvent),
}

impl Envelope {
    pub fn direction(&self) -> Direction {
        match self {
            Envelope::Inbound(_) => Direction::Inbound,
            Envelope::Outbound(_) => Direction::Outbound,
        }
    }

    pub fn conversation_key(&self) -> ConversationKey {
        match self {
            Envelope::Inbound(e) => e.conversation_key(),
            Envelope::Outbound(e) => e.conversation_key(),
        }
    }

    pub fn idempotency_key(&self) -> String {
        match self {
            Envelope::Inbound(e) => e.idempotency_key(),
            Envelope::Outbound(e) => e.idempotency_key(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize event envelope")
    }

    /// Parse a stored payload and check it belongs on the given loop.
    /// Errors here are permanent: the row cannot become valid by retrying.
    pub fn decode(expected: Direction, payload: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(payload).context("Malformed event payload")?;
        if envelope.direction() != expected {
            anyhow::bail!(
                "payload kind {} does not match queue direction {}",
                envelope.direction(),
                expected
            );
        }
        match &envelope {
            Envelope::Inbound(e) => e.validate()?,
            Envelope::Outbound(e) => e.validate()?,
        }
        Ok(envelope)
    }
}
