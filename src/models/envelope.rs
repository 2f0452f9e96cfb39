//! Message envelope: the unit the bus routes between agents and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::agent::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Closed set of message kinds the bus will route. Anything else is dropped
/// and logged at deserialization time (spec.md §4.2) — this enum has no
/// catch-all variant by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskRequest,
    TaskResponse,
    TaskProgress,
    TaskCancel,
    Heartbeat,
    AgentRegister,
    AgentDeregister,
    CoordinationRequest,
    CoordinationReply,
    ConflictReport,
    RecoveryDirective,
    StatusRequest,
    StatusReply,
    EmergencyAlert,
}

/// Where an envelope is headed: a specific agent, or a topic for fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Recipient {
    Agent(AgentId),
    Topic(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub retry_count: u32,
    /// Monotonic, per-topic publish order, assigned by `MessageBus::publish`
    /// (`0` until published). Cursor-based resend (spec.md §6) compares this
    /// rather than `id`, which is a random UUID and carries no ordering.
    pub sequence: u64,
}

impl Envelope {
    pub fn new(
        sender: impl Into<String>,
        recipient: Recipient,
        kind: MessageKind,
        payload: serde_json::Value,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            sender: sender.into(),
            recipient,
            kind,
            correlation_id: None,
            created_at: now,
            expires_at: now + ttl,
            payload,
            priority: 3,
            retry_count: 0,
            sequence: 0,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Build the reply half of a request/reply pair: same correlation id,
    /// recipient flipped to the original sender.
    pub fn reply(
        &self,
        sender: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
        ttl: chrono::Duration,
    ) -> Option<Envelope> {
        let correlation_id = self.correlation_id?;
        Some(
            Envelope::new(sender, Recipient::Agent(AgentId::from(self.sender.clone())), kind, payload, ttl)
                .with_correlation(correlation_id),
        )
    }
}
