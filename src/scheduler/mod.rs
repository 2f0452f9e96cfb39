//! Dependency scheduler: executes a subtask DAG to completion or classified
//! failure, honoring dependencies, parallelism bounds, and cancellation.
//!
//! One [`SchedulerRuntime`] exists per workflow, owned by the engine's
//! per-workflow runtime. Deadlines race a `tokio::time::sleep` against the
//! subtask's reply — the same `tokio::select!` shape the teacher uses for
//! agent-execution timeouts in `engine/agents.rs`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::{BusError, MessageBus};
use crate::models::agent::{AgentHealth, AgentId};
use crate::models::envelope::{Envelope, MessageKind, Recipient};
use crate::models::subtask::{Subtask, SubtaskId};
use crate::models::task::TaskStatus;
use crate::recovery::FailureKind;
use crate::registry::AgentRegistry;

/// Outcome of dispatching and waiting on one subtask.
#[derive(Debug, Clone)]
pub enum SubtaskOutcome {
    Completed { subtask_id: SubtaskId, output: serde_json::Value },
    Failed { subtask_id: SubtaskId, kind: FailureKind },
    Cancelled { subtask_id: SubtaskId },
}

/// Terminal result of running a DAG to completion.
#[derive(Debug, Clone)]
pub enum SchedulerResult {
    AllCompleted,
    Failed { subtask_id: SubtaskId, kind: FailureKind },
    Cancelled,
}

/// A ready-queue entry ordered `(priority asc, subtask id asc)` — the stable
/// tie-break spec.md §4.4 requires among equal-priority, equally-ready
/// subtasks.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    priority: u8,
    subtask_id: SubtaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert priority so lower numbers (higher
        // priority per spec.md §3) pop first, then break ties by id.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.subtask_id.cmp(&self.subtask_id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct SchedulerRuntime {
    subtasks: HashMap<SubtaskId, Subtask>,
    priorities: HashMap<SubtaskId, u8>,
    completed: HashSet<SubtaskId>,
    in_flight: HashSet<SubtaskId>,
    parallelism_cap: usize,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    cancelled: bool,
    /// Where a dispatched agent should address its `task_response` — the
    /// workflow's own bus inbox, drained by the engine (spec.md §4.4).
    reply_to: AgentId,
}

impl SchedulerRuntime {
    pub fn new(
        subtasks: Vec<Subtask>,
        parallelism_cap: usize,
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        reply_to: AgentId,
    ) -> Self {
        // each subtask already carries its own scheduling priority (the
        // parent task's declared priority, or a decomposition-proposed
        // override) — spec.md §4.4's "pop a subtask (priority first, then
        // FIFO)".
        let priorities = subtasks.iter().map(|s| (s.id, s.priority)).collect();
        Self {
            subtasks: subtasks.into_iter().map(|s| (s.id, s)).collect(),
            priorities,
            completed: HashSet::new(),
            in_flight: HashSet::new(),
            parallelism_cap,
            bus,
            registry,
            cancelled: false,
            reply_to,
        }
    }

    /// Rebuild a scheduler from checkpointed subtask state after `Resume`
    /// (spec.md §8 scenario #6). Already-`completed` subtasks seed the ready
    /// set's dependency-satisfaction view. A subtask still `in_progress` when
    /// the process stopped keeps its recorded assignee — the checkpointed
    /// `assignee` field is the durable record of the original assignment
    /// tiebreak (spec.md §4.1's determinism-for-replay rule) — as long as
    /// that agent is still registered, healthy, and capable; it's given a
    /// fresh deadline and put back in flight rather than re-matched. Only
    /// when the original agent is gone does this fall back to a plain reset,
    /// an unavoidable (and logged) re-roll rather than the deterministic
    /// case spec.md describes.
    pub fn resume(
        subtasks: Vec<Subtask>,
        parallelism_cap: usize,
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        reply_to: AgentId,
        deadline_secs: i64,
    ) -> Self {
        let mut runtime = Self::new(subtasks, parallelism_cap, bus, registry, reply_to);
        let statuses: Vec<(SubtaskId, TaskStatus)> =
            runtime.subtasks.values().map(|s| (s.id, s.status)).collect();

        for (subtask_id, status) in statuses {
            match status {
                TaskStatus::Completed => {
                    runtime.completed.insert(subtask_id);
                }
                TaskStatus::InProgress => {
                    let subtask = &runtime.subtasks[&subtask_id];
                    let original_assignee = subtask.assignee.clone();
                    let required = subtask.required_capabilities.clone();
                    let still_viable = original_assignee
                        .as_ref()
                        .and_then(|agent_id| runtime.registry.get(agent_id))
                        .map(|agent| agent.health == AgentHealth::Healthy && agent.satisfies(&required))
                        .unwrap_or(false);

                    if still_viable {
                        let agent_id = original_assignee.unwrap();
                        let deadline = chrono::Utc::now() + chrono::Duration::seconds(deadline_secs);
                        runtime.subtasks.get_mut(&subtask_id).unwrap().deadline = Some(deadline);
                        runtime.registry.mark_assigned(&agent_id);
                        runtime.in_flight.insert(subtask_id);
                        info!(%subtask_id, agent_id = %agent_id, "resumed subtask kept on its recorded agent");
                    } else {
                        warn!(%subtask_id, "resumed subtask's recorded agent is no longer viable; re-dispatching fresh");
                        runtime.subtasks.get_mut(&subtask_id).unwrap().reset_for_retry(None);
                    }
                }
                _ => {}
            }
        }
        runtime
    }

    fn ready_queue(&self) -> BinaryHeap<ReadyEntry> {
        self.subtasks
            .values()
            .filter(|s| s.is_ready(&self.completed) && !self.in_flight.contains(&s.id))
            .map(|s| ReadyEntry { priority: *self.priorities.get(&s.id).unwrap_or(&3), subtask_id: s.id })
            .collect()
    }

    /// Dispatch as many ready subtasks as the parallelism cap allows.
    /// Invariant: in-flight count never exceeds `parallelism_cap`
    /// (spec.md §4.4, §8 property #3); dispatch only occurs once dependencies
    /// are all `completed` (§8 property #2).
    pub async fn dispatch_ready(&mut self, deadline_secs: i64) -> Vec<(SubtaskId, AgentId)> {
        if self.cancelled {
            return vec![];
        }
        let mut dispatched = Vec::new();
        let mut ready = self.ready_queue();

        while self.in_flight.len() < self.parallelism_cap {
            let Some(entry) = ready.pop() else { break };
            let subtask_id = entry.subtask_id;
            let required = self.subtasks.get(&subtask_id).unwrap().required_capabilities.clone();
            let candidates = self.registry.match_candidates(&required, 1);

            let Some(agent_id) = candidates.into_iter().next() else {
                // capability_missing: leave it out of in-flight; the engine's
                // recovery path will observe this via `unassignable_subtasks`.
                continue;
            };

            let deadline = chrono::Utc::now() + chrono::Duration::seconds(deadline_secs);
            let subtask = self.subtasks.get_mut(&subtask_id).unwrap();
            subtask.dispatch(agent_id.clone(), deadline);
            self.registry.mark_assigned(&agent_id);
            self.in_flight.insert(subtask_id);

            let envelope = Envelope::new(
                "scheduler",
                Recipient::Agent(agent_id.clone()),
                MessageKind::TaskRequest,
                serde_json::json!({
                    "subtask_id": subtask_id,
                    "title": subtask.title,
                    "description": subtask.description,
                    "reply_to": self.reply_to.as_str(),
                }),
                chrono::Duration::seconds(deadline_secs),
            );
            match self.bus.send(&agent_id, envelope).await {
                Ok(()) => {
                    info!(%subtask_id, agent_id = %agent_id, "subtask dispatched");
                    dispatched.push((subtask_id, agent_id));
                }
                Err(e) => {
                    warn!(%subtask_id, agent_id = %agent_id, error = %e, "dispatch failed");
                    self.in_flight.remove(&subtask_id);
                    self.registry.release_slot(&agent_id);
                    let subtask = self.subtasks.get_mut(&subtask_id).unwrap();
                    subtask.reset_for_retry(None);
                }
            }
        }
        dispatched
    }

    /// Apply a `task_response` result for one in-flight subtask.
    pub fn complete(&mut self, subtask_id: SubtaskId, output: serde_json::Value) {
        if let Some(subtask) = self.subtasks.get_mut(&subtask_id) {
            subtask.complete(output);
            if let Some(agent_id) = subtask.assignee.clone() {
                self.registry.release_slot(&agent_id);
            }
        }
        self.in_flight.remove(&subtask_id);
        self.completed.insert(subtask_id);
    }

    pub fn fail(&mut self, subtask_id: SubtaskId) {
        if let Some(subtask) = self.subtasks.get_mut(&subtask_id) {
            subtask.fail();
            if let Some(agent_id) = subtask.assignee.clone() {
                self.registry.release_slot(&agent_id);
            }
        }
        self.in_flight.remove(&subtask_id);
    }

    /// Deadline expiry with no `task_response`: classified `subtask_timeout`,
    /// the agent's slot released best-effort (spec.md §4.4).
    pub fn timeout(&mut self, subtask_id: SubtaskId) -> FailureKind {
        self.fail(subtask_id);
        FailureKind::SubtaskTimeout
    }

    /// In-flight subtasks whose dispatch deadline has already passed, paired
    /// with their current attempt count for the recovery decision. Read-only:
    /// the caller decides retry-vs-fail before mutating status via
    /// [`Self::reassign`] or [`Self::timeout`] (spec.md §4.4, §4.5).
    pub fn overdue(&self) -> Vec<(SubtaskId, u32)> {
        let now = chrono::Utc::now();
        self.subtasks
            .values()
            .filter(|s| s.status == TaskStatus::InProgress && s.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|s| (s.id, s.attempt_count))
            .collect()
    }

    /// Reset a subtask for reassignment after a recovery decision, releasing
    /// the original assignee's slot the same way [`Self::complete`]/
    /// [`Self::fail`] do — otherwise a reassigned agent's load never comes
    /// back down and `match_candidates` keeps passing over it.
    pub fn reassign(&mut self, subtask_id: SubtaskId) {
        if let Some(subtask) = self.subtasks.get_mut(&subtask_id) {
            if let Some(agent_id) = subtask.assignee.clone() {
                self.registry.release_slot(&agent_id);
            }
            subtask.reset_for_retry(None);
        }
        self.in_flight.remove(&subtask_id);
    }

    /// Cancel the whole DAG: in-flight subtasks get `task_cancel`, completed
    /// ones keep their results for audit, not-yet-dispatched ones never run
    /// (spec.md §4.4, §8 scenario #4).
    pub async fn cancel(&mut self) {
        self.cancelled = true;
        let in_flight: Vec<SubtaskId> = self.in_flight.iter().copied().collect();
        for subtask_id in in_flight {
            if let Some(subtask) = self.subtasks.get_mut(&subtask_id) {
                if let Some(agent_id) = subtask.assignee.clone() {
                    let envelope = Envelope::new(
                        "scheduler",
                        Recipient::Agent(agent_id.clone()),
                        MessageKind::TaskCancel,
                        serde_json::json!({"subtask_id": subtask_id}),
                        chrono::Duration::seconds(30),
                    );
                    let _ = self.bus.send(&agent_id, envelope).await;
                }
                subtask.cancel();
            }
        }
        for subtask in self.subtasks.values_mut() {
            if subtask.status == TaskStatus::Pending {
                subtask.cancel();
            }
        }
        self.in_flight.clear();
    }

    /// `None` while the DAG is still running; `Some` once every subtask has
    /// reached a terminal status one way or another.
    pub fn is_terminal(&self) -> Option<SchedulerResult> {
        if self.cancelled {
            return Some(SchedulerResult::Cancelled);
        }
        if let Some(subtask) = self.subtasks.values().find(|s| s.status == TaskStatus::Failed) {
            return Some(SchedulerResult::Failed { subtask_id: subtask.id, kind: FailureKind::SubtaskTimeout });
        }
        if self.subtasks.values().all(|s| s.status == TaskStatus::Completed) {
            Some(SchedulerResult::AllCompleted)
        } else {
            None
        }
    }

    pub fn all_done(&self) -> bool {
        self.subtasks.values().all(|s| s.status.is_terminal())
    }

    pub fn subtask(&self, id: &SubtaskId) -> Option<&Subtask> {
        self.subtasks.get(id)
    }

    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.values()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Race an in-flight subtask's deadline against its completion. Returns
    /// `Some(SubtaskId)` if the deadline won.
    pub async fn await_deadline(&self, subtask_id: SubtaskId) -> Option<SubtaskId> {
        let subtask = self.subtasks.get(&subtask_id)?;
        let deadline = subtask.deadline?;
        let now = chrono::Utc::now();
        if deadline <= now {
            return Some(subtask_id);
        }
        let wait = (deadline - now).to_std().unwrap_or(Duration::from_secs(0));
        tokio::time::sleep(wait).await;
        Some(subtask_id)
    }
}

pub fn bus_error_to_failure(_e: &BusError) -> FailureKind {
    FailureKind::TransientNetwork
}
