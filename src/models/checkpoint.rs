//! Checkpoint: a persistent snapshot sufficient for deterministic replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::workflow::{Phase, Workflow, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-deterministic decision made during a phase, recorded so replay can
/// re-apply it instead of re-consulting the LLM or re-rolling a tiebreak —
/// spec.md §4.1's determinism-for-replay rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordedDecision {
    LlmAnalysis { complexity_score: f32, needs_decomposition: bool },
    LlmDecomposition { raw_subtask_count: usize },
    AssignmentTiebreak { subtask_id: crate::models::subtask::SubtaskId, chosen_agent: String },
}

/// One entry in a workflow's totally-ordered checkpoint log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub workflow_id: WorkflowId,
    pub step_id: u64,
    pub phase: Phase,
    pub state: Workflow,
    pub decisions: Vec<RecordedDecision>,
    pub captured_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn capture(workflow: &Workflow, step_id: u64, decisions: Vec<RecordedDecision>) -> Self {
        Self {
            id: CheckpointId::new(),
            workflow_id: workflow.id,
            step_id,
            phase: workflow.phase,
            state: workflow.clone(),
            decisions,
            captured_at: Utc::now(),
        }
    }
}
