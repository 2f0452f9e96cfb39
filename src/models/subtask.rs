//! Subtask: one node in a decomposed task's dependency DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::agent::AgentId;
use crate::models::task::{TaskId, TaskStatus};

/// Unique identifier for a subtask, scoped to its parent task's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubtaskId(pub Uuid);

impl SubtaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubtaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in a task's dependency DAG, as produced by decomposition and
/// validated by the engine before being handed to the scheduler.
///
/// Co-owned by the scheduler (dispatch state: `status`, `assignee`,
/// `attempt_count`) and the assigned agent (execution state, surfaced back
/// through `task_response` envelopes) per spec.md §3's ownership rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub parent_task_id: TaskId,
    pub title: String,
    pub description: String,
    pub required_capabilities: HashSet<String>,
    pub dependencies: HashSet<SubtaskId>,
    pub status: TaskStatus,
    pub assignee: Option<AgentId>,
    pub attempt_count: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    /// Scheduling priority, 1 (highest) through 5 (lowest) — inherited from
    /// the parent task's declared priority unless decomposition proposes a
    /// more specific one (spec.md §3, §4.4's "pop a subtask (priority first,
    /// then FIFO)").
    pub priority: u8,
}

impl Subtask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_task_id: TaskId,
        title: String,
        description: String,
        required_capabilities: HashSet<String>,
        dependencies: HashSet<SubtaskId>,
        priority: u8,
    ) -> Self {
        Self {
            id: SubtaskId::new(),
            parent_task_id,
            title,
            description,
            required_capabilities,
            dependencies,
            status: TaskStatus::Pending,
            assignee: None,
            attempt_count: 0,
            deadline: None,
            output: None,
            priority,
        }
    }

    /// A subtask is dispatchable only when every dependency has completed —
    /// spec.md §3's subtask invariant and §8's testable property #2.
    pub fn is_ready(&self, completed: &HashSet<SubtaskId>) -> bool {
        self.status == TaskStatus::Pending && self.dependencies.iter().all(|d| completed.contains(d))
    }

    /// Reset a subtask for a fresh dispatch attempt (reassignment, retry).
    /// This is the one sanctioned way status moves backward from
    /// `InProgress`/`Failed` to `Pending` — an explicit "recovery reset" per
    /// spec.md §3, never an implicit one. Does not itself count as an
    /// attempt: `dispatch` is what increments `attempt_count`, since a reset
    /// subtask may sit `pending` for a while before it is actually handed to
    /// an agent again.
    pub fn reset_for_retry(&mut self, deadline: Option<DateTime<Utc>>) {
        self.status = TaskStatus::Pending;
        self.assignee = None;
        self.deadline = deadline;
    }

    /// Hand the subtask to an agent. Counts as one attempt — the first
    /// `dispatch` after construction makes `attempt_count == 1`, matching
    /// what `GetStatus` reports externally (spec.md §8 scenario 3).
    pub fn dispatch(&mut self, assignee: AgentId, deadline: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.assignee = Some(assignee);
        self.attempt_count += 1;
        self.deadline = Some(deadline);
    }

    pub fn complete(&mut self, output: serde_json::Value) {
        self.status = TaskStatus::Completed;
        self.output = Some(output);
    }

    pub fn fail(&mut self) {
        self.status = TaskStatus::Failed;
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Cancelled;
        }
    }
}

/// Validate a proposed subtask set is acyclic — spec.md §4.1's decomposition
/// validation and §8's "DAG with cycles rejected" boundary behavior.
pub fn validate_acyclic(subtasks: &[Subtask]) -> Result<(), String> {
    let mut visiting: HashSet<SubtaskId> = HashSet::new();
    let mut visited: HashSet<SubtaskId> = HashSet::new();
    let by_id: std::collections::HashMap<SubtaskId, &Subtask> =
        subtasks.iter().map(|s| (s.id, s)).collect();

    fn visit(
        id: SubtaskId,
        by_id: &std::collections::HashMap<SubtaskId, &Subtask>,
        visiting: &mut HashSet<SubtaskId>,
        visited: &mut HashSet<SubtaskId>,
    ) -> Result<(), String> {
        if visited.contains(&id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(format!("dependency cycle detected at subtask {id}"));
        }
        if let Some(node) = by_id.get(&id) {
            for dep in &node.dependencies {
                visit(*dep, by_id, visiting, visited)?;
            }
        }
        visiting.remove(&id);
        visited.insert(id);
        Ok(())
    }

    for s in subtasks {
        visit(s.id, &by_id, &mut visiting, &mut visited)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(parent: TaskId) -> Subtask {
        Subtask::new(parent, "t".into(), "d".into(), HashSet::new(), HashSet::new(), 3)
    }

    #[test]
    fn readiness_requires_all_dependencies_complete() {
        let parent = TaskId::new();
        let mut a = dummy(parent);
        let b_deps: HashSet<SubtaskId> = [a.id].into_iter().collect();
        let b = Subtask::new(parent, "b".into(), "d".into(), HashSet::new(), b_deps, 3);

        let mut completed = HashSet::new();
        assert!(!b.is_ready(&completed));
        a.complete(serde_json::json!(null));
        completed.insert(a.id);
        assert!(b.is_ready(&completed));
    }

    #[test]
    fn first_dispatch_counts_as_attempt_one() {
        let mut a = dummy(TaskId::new());
        assert_eq!(a.attempt_count, 0);
        a.dispatch(AgentId::from("x"), Utc::now());
        assert_eq!(a.attempt_count, 1);
        a.reset_for_retry(None);
        assert_eq!(a.attempt_count, 1, "a reset alone is not a dispatch attempt");
        a.dispatch(AgentId::from("y"), Utc::now());
        assert_eq!(a.attempt_count, 2);
    }

    #[test]
    fn detects_cycles() {
        let parent = TaskId::new();
        let mut a = dummy(parent);
        let mut b = dummy(parent);
        a.dependencies.insert(b.id);
        b.dependencies.insert(a.id);
        let err = validate_acyclic(&[a, b]).unwrap_err();
        assert!(err.contains("cycle"));
    }
}
