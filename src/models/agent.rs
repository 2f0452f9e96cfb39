//! Agent registry entry: the authoritative record of one executor in the
//! fleet, grounded on the teacher's `AgentId` newtype (`models/agent.rs`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Unique identifier for an agent. Agents are operator-registered, so the ID
/// is a human-assigned string rather than a generated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What a caller supplies to `Register` — spec.md §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: HashSet<String>,
    pub max_concurrent_slots: u32,
}

/// Per-agent health state machine: `registered -> healthy -> degraded ->
/// unreachable -> deregistered`, with `unreachable -> healthy` on a fresh
/// heartbeat or registration (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Registered,
    Healthy,
    Degraded,
    Unreachable,
}

/// The registry's authoritative record for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: HashSet<String>,
    pub max_concurrent_slots: u32,
    pub current_load: u32,
    pub health: AgentHealth,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl AgentEntry {
    pub fn from_descriptor(descriptor: AgentDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id,
            agent_type: descriptor.agent_type,
            capabilities: descriptor.capabilities,
            max_concurrent_slots: descriptor.max_concurrent_slots,
            current_load: 0,
            health: AgentHealth::Registered,
            last_heartbeat: now,
            registered_at: now,
            last_assigned_at: None,
        }
    }

    /// `current_load <= max_concurrent_slots` is an invariant of this type
    /// (spec.md §3); callers must check `has_capacity` before incrementing.
    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_slots
    }

    pub fn satisfies(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn is_stale(&self, heartbeat_timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > heartbeat_timeout
    }

    /// True once a heartbeat is overdue by more than `degraded_threshold`
    /// but hasn't yet crossed the full `heartbeat_timeout` — "slow but still
    /// arriving" (spec.md §3's `healthy -> degraded -> unreachable` chain).
    pub fn is_slow(&self, degraded_threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > degraded_threshold
    }
}
