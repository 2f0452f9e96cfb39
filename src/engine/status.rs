//! Read-optimized workflow snapshot for `GetStatus` — spec.md §4.1, §6.
//!
//! Maintained as a plain cloned value in a side `DashMap`, updated at every
//! phase transition, so a concurrent `GetStatus` never contends with the
//! workflow's own transition lock.

use serde::Serialize;

use crate::models::task::{Task, TaskId, TaskStatus};
use crate::models::workflow::{Phase, Workflow};
use crate::recovery::FailureKind;

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskStatus {
    pub id: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub kind: FailureKind,
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub phase: Phase,
    pub progress: f64,
    pub subtasks: Vec<SubtaskStatus>,
    pub last_error: Option<LastError>,
    pub degraded: bool,
    pub quarantined: bool,
}

impl WorkflowSnapshot {
    pub fn from_workflow(task: &Task, workflow: &Workflow) -> Self {
        let subtasks = workflow
            .subtasks
            .values()
            .map(|s| SubtaskStatus {
                id: s.id.to_string(),
                status: s.status,
                assignee: s.assignee.as_ref().map(|a| a.to_string()),
                attempts: s.attempt_count,
            })
            .collect();

        let last_error = workflow.error_log.last().map(|e| LastError {
            kind: e.kind,
            phase: e.phase,
            message: e.message.clone(),
        });

        Self {
            task_id: task.id,
            status: task.status,
            phase: workflow.phase,
            progress: workflow.completion_ratio(),
            subtasks,
            last_error,
            degraded: workflow.degraded,
            quarantined: workflow.quarantined,
        }
    }
}
