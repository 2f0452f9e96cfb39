//! Task: the unit of work a requester submits to the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{OrchestratorError, Result};

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority, 1 (highest) through 5 (lowest). Bounded at construction so
/// that an out-of-range priority can never enter the system past `SubmitTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub fn new(value: u8) -> Result<Self> {
        if !(1..=5).contains(&value) {
            return Err(OrchestratorError::InvalidInput(format!(
                "priority must be between 1 and 5, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Lifecycle status shared by `Task` and `Subtask`.
///
/// Once a task or subtask reaches `Completed` or `Cancelled` its status never
/// changes again — that invariant is enforced by the engine/scheduler, not by
/// this type, since the type itself has no notion of "current" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed)
    }
}

/// A user-submitted unit of work.
///
/// Owned by the workflow engine for its whole lifetime (see `models` doc
/// comment). `input` and `output` are opaque structured blobs — the engine
/// never inspects their shape, only the LLM adapter and the assigned agents
/// do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub requester_id: String,
    pub metadata: HashMap<String, String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    /// Validate and construct a new pending task. Mirrors the validation
    /// `SubmitTask` performs in spec.md §4.1: empty required fields or an
    /// out-of-range priority are rejected before a workflow is ever opened.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: String,
        description: String,
        task_type: String,
        priority: u8,
        input: serde_json::Value,
        requester_id: String,
        metadata: HashMap<String, String>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        if title.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("title must not be empty".into()));
        }
        if description.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "description must not be empty".into(),
            ));
        }
        if requester_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "requester_id must not be empty".into(),
            ));
        }
        let priority = Priority::new(priority)?;

        Ok(Self {
            id: TaskId::new(),
            title,
            description,
            task_type,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input,
            output: None,
            requester_id,
            metadata,
            deadline,
        })
    }

    /// Mark the task completed with its final output. Never called on a
    /// task whose status is already terminal.
    pub fn complete(&mut self, output: serde_json::Value) {
        debug_assert!(!self.status.is_terminal());
        self.status = TaskStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self) {
        debug_assert!(!self.status.is_terminal());
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
