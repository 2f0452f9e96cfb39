//! Workflow: the engine's per-task state machine instance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::checkpoint::CheckpointId;
use crate::models::subtask::{Subtask, SubtaskId};
use crate::models::task::TaskId;
use crate::models::agent::AgentId;
use crate::recovery::FailureKind;

/// Unique identifier for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A phase in the workflow's state machine. Transitions between phases are
/// monotone along the directed graph in spec.md §4.1:
///
/// ```text
/// initialization -> analysis -> (decomposition | coordination)
/// decomposition -> coordination
/// coordination -> execution
/// execution -> review
/// review -> (completion | execution [rework] | error_handling)
/// error_handling -> (the phase that raised) | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    Analysis,
    Decomposition,
    Coordination,
    Execution,
    Review,
    Completion,
    ErrorHandling,
    Failed,
}

impl Phase {
    /// Whether `to` is a legal direct transition from `self`. `ErrorHandling`
    /// is reachable from every active phase (any stage may divert into it),
    /// and it may loop back to the phase that raised it or escalate to
    /// `Failed`; the caller supplies which phase raised to validate the
    /// return edge.
    pub fn can_transition(&self, to: Phase, raised_from: Option<Phase>) -> bool {
        use Phase::*;
        match (*self, to) {
            (Initialization, Analysis) => true,
            (Analysis, Decomposition) | (Analysis, Coordination) => true,
            (Decomposition, Coordination) => true,
            (Coordination, Execution) => true,
            (Execution, Review) => true,
            (Review, Completion) | (Review, Execution) => true,
            (ErrorHandling, Failed) => true,
            (ErrorHandling, p) => raised_from == Some(p),
            (from, ErrorHandling) if from != ErrorHandling && from != Failed && from != Completion => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completion | Phase::Failed)
    }
}

/// One entry in the error log accumulated across a workflow's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub kind: FailureKind,
    pub phase: Phase,
    pub message: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

/// The engine's per-task state machine instance.
///
/// Phase transitions are serialized per workflow (spec.md §5); this struct
/// itself carries no lock — the engine's per-workflow runtime wraps it in a
/// `Mutex` so the struct stays a plain, checkpoint-serializable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub task_id: TaskId,
    pub phase: Phase,
    pub checkpoint_ids: Vec<CheckpointId>,
    pub subtasks: HashMap<SubtaskId, Subtask>,
    pub assignments: HashMap<SubtaskId, AgentId>,
    pub error_log: Vec<ErrorLogEntry>,
    pub error_handling_loops: u32,
    pub recovery_actions_taken: u32,
    pub review_attempts: u32,
    pub degraded: bool,
    /// Set when recovery decides `Quarantine` (spec.md: "corrupt_checkpoint
    /// ... is quarantined, not retried"). A quarantined workflow stops
    /// driving forever mid-`error_handling`, so this is the only way
    /// `GetStatus` distinguishes it from a workflow still working through
    /// recovery.
    pub quarantined: bool,
}

impl Workflow {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            id: WorkflowId::new(),
            task_id,
            phase: Phase::Initialization,
            checkpoint_ids: Vec::new(),
            subtasks: HashMap::new(),
            assignments: HashMap::new(),
            error_log: Vec::new(),
            error_handling_loops: 0,
            recovery_actions_taken: 0,
            review_attempts: 0,
            degraded: false,
            quarantined: false,
        }
    }

    /// Attempt a phase transition, recording it only if legal. Returns the
    /// previous phase on success so callers can remember where to resume
    /// after `error_handling`.
    pub fn transition(&mut self, to: Phase, raised_from: Option<Phase>) -> Result<Phase, String> {
        if !self.phase.can_transition(to, raised_from) {
            return Err(format!("illegal transition {:?} -> {:?}", self.phase, to));
        }
        let from = self.phase;
        self.phase = to;
        Ok(from)
    }

    pub fn record_checkpoint(&mut self, id: CheckpointId) {
        self.checkpoint_ids.push(id);
    }

    pub fn record_error(&mut self, kind: FailureKind, message: String) {
        self.error_log.push(ErrorLogEntry {
            kind,
            phase: self.phase,
            message,
            occurred_at: chrono::Utc::now(),
        });
    }

    /// Completion ratio over all subtasks, or 1.0 for an undecomposed task
    /// that has completed, 0.0 otherwise — used by `GetStatus`.
    pub fn completion_ratio(&self) -> f64 {
        if self.subtasks.is_empty() {
            return if self.phase == Phase::Completion { 1.0 } else { 0.0 };
        }
        let completed = self
            .subtasks
            .values()
            .filter(|s| s.status == crate::models::task::TaskStatus::Completed)
            .count();
        completed as f64 / self.subtasks.len() as f64
    }
}
