//! Per-workflow runtime state, owned by one `Mutex` entry in the engine's
//! `DashMap` so phase transitions for a single workflow are serialized
//! (spec.md §5's ordering guarantee) without blocking other workflows.

use crate::models::task::Task;
use crate::models::workflow::Workflow;
use crate::scheduler::SchedulerRuntime;

pub struct WorkflowRuntime {
    pub task: Task,
    pub workflow: Workflow,
    pub scheduler: Option<SchedulerRuntime>,
    pub step: u64,
    pub cancelled: bool,
}

impl WorkflowRuntime {
    pub fn new(task: Task, workflow: Workflow) -> Self {
        Self { task, workflow, scheduler: None, step: 0, cancelled: false }
    }
}
