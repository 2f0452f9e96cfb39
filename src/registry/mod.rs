//! Agent registry & lifecycle: the authoritative view of which agents
//! exist, what they can do, and whether they are alive.
//!
//! Backed by a `DashMap` for O(1) register/heartbeat/snapshot (grounded on
//! the teacher's `dashmap`-backed concurrent maps in `api/agents/middleware.rs`),
//! plus a background sweep task that demotes stale agents to `unreachable`
//! and raises a `recovery_directive` for each of their in-flight subtasks —
//! the engine-facing analogue of the teacher's `EventBus`-driven background
//! publication pattern in `engine/events.rs`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::models::agent::{AgentDescriptor, AgentEntry, AgentHealth, AgentId};
use crate::models::envelope::{Envelope, MessageKind, Recipient};
use crate::Result;

/// Snapshot entry for read-optimized status APIs (spec.md §4.3 `Snapshot`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub current_load: u32,
    pub max_concurrent_slots: u32,
    pub health: AgentHealth,
}

impl From<&AgentEntry> for AgentInfo {
    fn from(entry: &AgentEntry) -> Self {
        Self {
            id: entry.id.clone(),
            agent_type: entry.agent_type.clone(),
            capabilities: entry.capabilities.iter().cloned().collect(),
            current_load: entry.current_load,
            max_concurrent_slots: entry.max_concurrent_slots,
            health: entry.health,
        }
    }
}

pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentEntry>,
    heartbeat_timeout: chrono::Duration,
    bus: Arc<MessageBus>,
}

impl AgentRegistry {
    pub fn new(bus: Arc<MessageBus>, heartbeat_timeout: chrono::Duration) -> Self {
        Self { agents: DashMap::new(), heartbeat_timeout, bus }
    }

    /// Idempotent by ID: re-registration updates capabilities and resets
    /// load counters to observed values (spec.md §4.3).
    pub fn register(&self, descriptor: AgentDescriptor) {
        let id = descriptor.id.clone();
        let mut entry = AgentEntry::from_descriptor(descriptor);
        entry.health = AgentHealth::Registered;
        info!(agent_id = %id, "agent registered");
        self.agents.insert(id, entry);
    }

    /// Removes the entry and signals the owner (scheduler, via the bus) to
    /// revoke any in-flight assignments.
    pub fn deregister(&self, agent_id: &AgentId) {
        if self.agents.remove(agent_id).is_some() {
            self.bus.deregister_recipient(agent_id);
            info!(agent_id = %agent_id, "agent deregistered");
        }
    }

    /// Updates last-heartbeat and current load; transitions `registered`,
    /// `degraded`, or `unreachable` agents back to `healthy` on a fresh
    /// heartbeat (spec.md §4.3).
    pub fn heartbeat(&self, agent_id: &AgentId, current_load: u32) -> Result<()> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| crate::OrchestratorError::NotFound(format!("agent {agent_id}")))?;
        entry.last_heartbeat = Utc::now();
        entry.current_load = current_load;
        if matches!(entry.health, AgentHealth::Registered | AgentHealth::Degraded | AgentHealth::Unreachable) {
            entry.health = AgentHealth::Healthy;
            self.bus.set_recipient_health(agent_id, true);
        }
        Ok(())
    }

    fn degraded_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_timeout.num_milliseconds() / 2)
    }

    /// Up to `count` candidates whose capabilities are a superset of
    /// `required`, ranked by ascending load, ties broken by earliest
    /// last-assignment (spec.md §4.3 `MatchCandidates`).
    pub fn match_candidates(&self, required: &std::collections::HashSet<String>, count: usize) -> Vec<AgentId> {
        let mut candidates: Vec<(AgentId, u32, Option<chrono::DateTime<Utc>>)> = self
            .agents
            .iter()
            .filter(|e| e.health == AgentHealth::Healthy && e.satisfies(required) && e.has_capacity())
            .map(|e| (e.id.clone(), e.current_load, e.last_assigned_at))
            .collect();

        candidates.sort_by(|a, b| {
            a.1.cmp(&b.1).then_with(|| match (a.2, b.2) {
                (Some(a), Some(b)) => a.cmp(&b),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
        });

        candidates.into_iter().take(count).map(|(id, _, _)| id).collect()
    }

    /// Record that a subtask was just assigned, for the fairness tiebreak
    /// and for load accounting.
    pub fn mark_assigned(&self, agent_id: &AgentId) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.current_load += 1;
            entry.last_assigned_at = Some(Utc::now());
        }
    }

    pub fn release_slot(&self, agent_id: &AgentId) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.current_load = entry.current_load.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> Vec<AgentInfo> {
        self.agents.iter().map(|e| AgentInfo::from(&*e)).collect()
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentEntry> {
        self.agents.get(agent_id).map(|e| e.clone())
    }

    /// Sweep for stale agents: any healthy/degraded agent whose heartbeat is
    /// older than T_hb becomes `unreachable`, and a `recovery_directive` is
    /// published per in-flight subtask it held (the caller supplies the
    /// in-flight map since the registry itself doesn't own scheduler state).
    /// An agent whose heartbeat is merely slow — overdue past the halfway
    /// point but not yet past T_hb — is marked `degraded` instead; it keeps
    /// its in-flight work since it's still arriving, just late.
    pub async fn sweep_stale(&self, in_flight_by_agent: &dashmap::DashMap<AgentId, Vec<crate::models::subtask::SubtaskId>>) {
        let now = Utc::now();
        let degraded_threshold = self.degraded_threshold();
        let mut newly_unreachable = Vec::new();
        for mut entry in self.agents.iter_mut() {
            if entry.health == AgentHealth::Unreachable {
                continue;
            }
            if entry.is_stale(self.heartbeat_timeout, now) {
                entry.health = AgentHealth::Unreachable;
                newly_unreachable.push(entry.id.clone());
            } else if entry.health == AgentHealth::Healthy && entry.is_slow(degraded_threshold, now) {
                entry.health = AgentHealth::Degraded;
                warn!(agent_id = %entry.id, "agent heartbeat slow, marking degraded");
            }
        }

        for agent_id in newly_unreachable {
            warn!(agent_id = %agent_id, "agent marked unreachable, reassigning in-flight work");
            self.bus.set_recipient_health(&agent_id, false);
            if let Some((_, subtask_ids)) = in_flight_by_agent.remove(&agent_id) {
                for subtask_id in subtask_ids {
                    let envelope = Envelope::new(
                        "registry",
                        Recipient::Topic("recovery".to_string()),
                        MessageKind::RecoveryDirective,
                        serde_json::json!({
                            "kind": "reassign",
                            "subtask_id": subtask_id,
                            "reason": "agent_unreachable",
                            "agent_id": agent_id.as_str(),
                        }),
                        chrono::Duration::minutes(5),
                    );
                    self.bus.publish("recovery", envelope).await;
                }
            }
        }
    }

    /// Spawn the periodic reaper task. Returns a handle the caller may abort
    /// on shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let in_flight: Arc<dashmap::DashMap<AgentId, Vec<crate::models::subtask::SubtaskId>>> =
            Arc::new(dashmap::DashMap::new());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep_stale(&in_flight).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(MessageBus::new(16)), chrono::Duration::seconds(60))
    }

    #[test]
    fn reregistration_replaces_capabilities() {
        let reg = registry();
        reg.register(AgentDescriptor {
            id: AgentId::from("a1"),
            agent_type: "worker".into(),
            capabilities: ["echo"].into_iter().map(String::from).collect(),
            max_concurrent_slots: 2,
        });
        reg.register(AgentDescriptor {
            id: AgentId::from("a1"),
            agent_type: "worker".into(),
            capabilities: ["analyze"].into_iter().map(String::from).collect(),
            max_concurrent_slots: 4,
        });
        let entry = reg.get(&AgentId::from("a1")).unwrap();
        assert!(entry.capabilities.contains("analyze"));
        assert!(!entry.capabilities.contains("echo"));
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn match_candidates_ranks_by_load_then_fairness() {
        let reg = registry();
        for (name, load) in [("a1", 2u32), ("a2", 0), ("a3", 2)] {
            reg.register(AgentDescriptor {
                id: AgentId::from(name),
                agent_type: "worker".into(),
                capabilities: ["echo"].into_iter().map(String::from).collect(),
                max_concurrent_slots: 5,
            });
            reg.heartbeat(&AgentId::from(name), load).unwrap();
        }
        let required: std::collections::HashSet<String> = ["echo"].into_iter().map(String::from).collect();
        let candidates = reg.match_candidates(&required, 3);
        assert_eq!(candidates[0], AgentId::from("a2"));
    }

    #[test]
    fn heartbeat_restores_healthy_from_unreachable() {
        let reg = registry();
        reg.register(AgentDescriptor {
            id: AgentId::from("a1"),
            agent_type: "worker".into(),
            capabilities: Default::default(),
            max_concurrent_slots: 1,
        });
        reg.agents.get_mut(&AgentId::from("a1")).unwrap().health = AgentHealth::Unreachable;
        reg.heartbeat(&AgentId::from("a1"), 0).unwrap();
        assert_eq!(reg.get(&AgentId::from("a1")).unwrap().health, AgentHealth::Healthy);
    }

    #[tokio::test]
    async fn sweep_marks_slow_heartbeats_degraded_before_unreachable() {
        let reg = registry(); // heartbeat_timeout = 60s, degraded_threshold = 30s
        reg.register(AgentDescriptor {
            id: AgentId::from("a1"),
            agent_type: "worker".into(),
            capabilities: Default::default(),
            max_concurrent_slots: 1,
        });
        reg.heartbeat(&AgentId::from("a1"), 0).unwrap();
        reg.agents.get_mut(&AgentId::from("a1")).unwrap().last_heartbeat = Utc::now() - chrono::Duration::seconds(40);

        let in_flight = dashmap::DashMap::new();
        reg.sweep_stale(&in_flight).await;
        assert_eq!(reg.get(&AgentId::from("a1")).unwrap().health, AgentHealth::Degraded);

        reg.heartbeat(&AgentId::from("a1"), 0).unwrap();
        assert_eq!(reg.get(&AgentId::from("a1")).unwrap().health, AgentHealth::Healthy);
    }
}
