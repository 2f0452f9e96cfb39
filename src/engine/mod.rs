//! Workflow engine: the per-task state machine and its checkpointing.
//!
//! The engine is the layer between the domain models and the external
//! world, in the same sense the teacher's `engine/` module is: domain types
//! live in `models/`, dispatch and scheduling concerns live in `scheduler`
//! and `registry`, and this module drives a workflow's phases end to end,
//! consulting the LLM adapter, handing DAGs to the scheduler, and recording
//! checkpoints before every transition (spec.md §4.1).

mod runtime;
mod status;

pub use status::WorkflowSnapshot;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::llm::{AnalyzeRequest, DecomposeRequest, LlmAdapter, LlmError};
use crate::models::agent::AgentId;
use crate::models::checkpoint::{Checkpoint, RecordedDecision};
use crate::models::envelope::MessageKind;
use crate::models::subtask::{validate_acyclic, Subtask, SubtaskId};
use crate::models::task::{Task, TaskId};
use crate::models::workflow::{Phase, Workflow, WorkflowId};
use crate::persistence::SharedPersistence;
use crate::recovery::{Failure, FailureKind, RecoveryAction, RecoveryBudget, RecoveryCoordinator};
use crate::registry::AgentRegistry;
use crate::scheduler::{SchedulerResult, SchedulerRuntime};
use crate::bus::MessageBus;
use crate::{OrchestratorError, Result};

use runtime::WorkflowRuntime;

/// The engine's public contract: `SubmitTask`, `CancelTask`, `GetStatus`,
/// `Resume` (spec.md §4.1), unchanged in meaning from the distilled spec.
pub struct WorkflowEngine {
    runtimes: DashMap<WorkflowId, tokio::sync::Mutex<WorkflowRuntime>>,
    snapshots: DashMap<WorkflowId, WorkflowSnapshot>,
    task_index: DashMap<TaskId, WorkflowId>,
    config: Arc<RuntimeConfig>,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    persistence: SharedPersistence,
    llm: Arc<dyn LlmAdapter>,
    workflow_semaphore: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(
        config: Arc<RuntimeConfig>,
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        persistence: SharedPersistence,
        llm: Arc<dyn LlmAdapter>,
    ) -> Arc<Self> {
        let workflow_semaphore = Arc::new(Semaphore::new(config.max_parallel_workflows));
        Arc::new(Self {
            runtimes: DashMap::new(),
            snapshots: DashMap::new(),
            task_index: DashMap::new(),
            config,
            bus,
            registry,
            persistence,
            llm,
            workflow_semaphore,
        })
    }

    /// Validate, persist a pending task, open a workflow at `initialization`,
    /// and return immediately — the driving phase loop runs on its own
    /// `tokio::task` (spec.md §4.1, §5's "each workflow runs as one logical
    /// task").
    pub async fn submit_task(self: &Arc<Self>, task: Task) -> Result<WorkflowId> {
        let workflow = Workflow::new(task.id);
        let workflow_id = workflow.id;
        self.task_index.insert(task.id, workflow_id);

        let snapshot = WorkflowSnapshot::from_workflow(&task, &workflow);
        self.snapshots.insert(workflow_id, snapshot);
        self.runtimes.insert(
            workflow_id,
            tokio::sync::Mutex::new(WorkflowRuntime::new(task, workflow)),
        );
        self.spawn_reply_drain(workflow_id);

        self.checkpoint(workflow_id, vec![]).await?;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drive(workflow_id).await {
                warn!(%workflow_id, error = %e, "workflow driving task exited with error");
            }
        });

        Ok(workflow_id)
    }

    /// Idempotent: cancelling a terminal workflow is a no-op returning the
    /// terminal status (spec.md §4.1, §8 round-trip law).
    pub async fn cancel_task(&self, workflow_id: WorkflowId) -> Result<WorkflowSnapshot> {
        let runtime_entry = self
            .runtimes
            .get(&workflow_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))?;
        let mut runtime = runtime_entry.lock().await;

        if runtime.workflow.phase.is_terminal() {
            return Ok(WorkflowSnapshot::from_workflow(&runtime.task, &runtime.workflow));
        }

        runtime.task.cancel();
        if let Some(scheduler) = runtime.scheduler.as_mut() {
            scheduler.cancel().await;
        }
        runtime.workflow.phase = Phase::Completion; // cancellation bypasses the normal graph
        runtime.cancelled = true;
        Self::sync_subtasks(&mut runtime);

        let snapshot = WorkflowSnapshot::from_workflow(&runtime.task, &runtime.workflow);
        self.snapshots.insert(workflow_id, snapshot.clone());
        drop(runtime);

        self.checkpoint(workflow_id, vec![]).await?;
        self.bus.deregister_recipient(&Self::workflow_inbox_id(workflow_id));
        info!(%workflow_id, "workflow cancelled");
        Ok(snapshot)
    }

    /// Lock-free relative to engine steps: reads the cloned snapshot
    /// maintained alongside the runtime rather than taking the workflow's
    /// own transition lock (spec.md §4.1).
    pub fn get_status(&self, workflow_id: WorkflowId) -> Result<WorkflowSnapshot> {
        self.snapshots
            .get(&workflow_id)
            .map(|s| s.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))
    }

    /// Resolve a task ID to its workflow and return its status. The external
    /// surface addresses everything by task ID (spec.md §6); internally the
    /// engine is keyed by workflow ID.
    pub fn get_status_by_task(&self, task_id: TaskId) -> Result<WorkflowSnapshot> {
        let workflow_id = self
            .task_index
            .get(&task_id)
            .map(|w| *w)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
        self.get_status(workflow_id)
    }

    pub async fn cancel_task_by_id(&self, task_id: TaskId) -> Result<WorkflowSnapshot> {
        let workflow_id = self
            .task_index
            .get(&task_id)
            .map(|w| *w)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;
        self.cancel_task(workflow_id).await
    }

    /// Handle to the shared message bus, for the API layer's SSE endpoint
    /// to subscribe to per-task completion-event topics.
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// The bus recipient ID a dispatched subtask's `task_response` is
    /// addressed back to — one dedicated inbox per workflow, drained by
    /// [`Self::spawn_reply_drain`] (spec.md §4.4).
    fn workflow_inbox_id(workflow_id: WorkflowId) -> AgentId {
        AgentId::new(format!("engine:{workflow_id}"))
    }

    /// Register the workflow's reply inbox and spawn the task that drains
    /// it, applying each `task_response` to the scheduler. The inbox closes
    /// (ending this task) once `transition` deregisters it at a terminal
    /// phase.
    fn spawn_reply_drain(self: &Arc<Self>, workflow_id: WorkflowId) {
        let inbox_id = Self::workflow_inbox_id(workflow_id);
        let mut receiver = self.bus.register_recipient(inbox_id);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if envelope.kind != MessageKind::TaskResponse {
                    continue;
                }
                let Some(subtask_id) = envelope
                    .payload
                    .get("subtask_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<uuid::Uuid>().ok())
                    .map(crate::models::subtask::SubtaskId)
                else {
                    warn!(%workflow_id, "task_response missing a parseable subtask_id");
                    continue;
                };
                let failed = envelope.payload.get("status").and_then(|v| v.as_str()) == Some("failed");
                let output = envelope.payload.get("output").cloned().unwrap_or(serde_json::Value::Null);

                let Some(entry) = engine.runtimes.get(&workflow_id) else { break };
                let mut runtime = entry.lock().await;
                let Some(scheduler) = runtime.scheduler.as_mut() else { continue };
                if failed {
                    scheduler.fail(subtask_id);
                } else {
                    scheduler.complete(subtask_id, output);
                }
            }
        });
    }

    /// Load the latest checkpoint and resume deterministically. A corrupt
    /// checkpoint is fatal for that workflow: it is quarantined, never
    /// retried (spec.md §4.1, §7).
    pub async fn resume(self: &Arc<Self>, workflow_id: WorkflowId) -> Result<()> {
        let checkpoint = self
            .persistence
            .latest_checkpoint(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))?;

        let task = self.load_task_for(&checkpoint).await?;
        let workflow = checkpoint.state;
        self.task_index.insert(task.id, workflow_id);

        if workflow.phase.is_terminal() {
            self.snapshots.insert(workflow_id, WorkflowSnapshot::from_workflow(&task, &workflow));
            return Ok(());
        }

        let scheduler = if workflow.subtasks.is_empty() {
            None
        } else {
            Some(SchedulerRuntime::resume(
                workflow.subtasks.values().cloned().collect(),
                self.config.per_workflow_parallelism,
                Arc::clone(&self.bus),
                Arc::clone(&self.registry),
                Self::workflow_inbox_id(workflow_id),
                self.config.subtask_deadline_secs(),
            ))
        };

        let mut runtime = WorkflowRuntime::new(task, workflow);
        runtime.scheduler = scheduler;
        self.snapshots
            .insert(workflow_id, WorkflowSnapshot::from_workflow(&runtime.task, &runtime.workflow));
        self.runtimes.insert(workflow_id, tokio::sync::Mutex::new(runtime));
        self.spawn_reply_drain(workflow_id);

        info!(%workflow_id, "workflow resumed from checkpoint");
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drive(workflow_id).await {
                warn!(%workflow_id, error = %e, "resumed workflow exited with error");
            }
        });
        Ok(())
    }

    async fn load_task_for(&self, checkpoint: &Checkpoint) -> Result<Task> {
        let key = format!("task:{}", checkpoint.state.task_id.0);
        let value = self
            .persistence
            .get_kv(&key)
            .await?
            .ok_or_else(|| OrchestratorError::Quarantined(checkpoint.workflow_id.to_string()))?;
        serde_json::from_value(value).map_err(OrchestratorError::from)
    }

    /// Pull the scheduler's live subtask state (status, assignee, output,
    /// attempt count) back into the checkpoint-facing `workflow.subtasks`
    /// map. The scheduler owns dispatch mutation directly on its own copy for
    /// speed; without this sync every checkpoint would keep replaying the
    /// subtask set exactly as it looked right after decomposition (spec.md §8
    /// property #1).
    fn sync_subtasks(runtime: &mut WorkflowRuntime) {
        let Some(scheduler) = runtime.scheduler.as_ref() else { return };
        let synced: Vec<Subtask> = scheduler.subtasks().cloned().collect();
        for subtask in synced {
            runtime.workflow.subtasks.insert(subtask.id, subtask);
        }
    }

    async fn checkpoint(&self, workflow_id: WorkflowId, decisions: Vec<RecordedDecision>) -> Result<()> {
        let runtime_entry = self
            .runtimes
            .get(&workflow_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))?;
        let mut runtime = runtime_entry.lock().await;
        Self::sync_subtasks(&mut runtime);
        runtime.step += 1;
        let step_id = runtime.step;
        let checkpoint = Checkpoint::capture(&runtime.workflow, step_id, decisions);
        runtime.workflow.record_checkpoint(checkpoint.id);
        let task_key = format!("task:{}", runtime.task.id.0);
        let task_value = serde_json::to_value(&runtime.task)?;
        drop(runtime);

        self.persistence.put_kv(&task_key, task_value).await?;
        self.persistence.put_checkpoint(&checkpoint).await
    }

    /// Drive a workflow's phases to completion or suspension. Acquires the
    /// global parallelism permit before `analysis` and holds it for the
    /// workflow's lifetime (spec.md §5, SPEC_FULL.md §5's `Semaphore`
    /// concretion).
    async fn drive(self: Arc<Self>, workflow_id: WorkflowId) -> Result<()> {
        let _permit = self.workflow_semaphore.clone().acquire_owned().await.map_err(|_| {
            OrchestratorError::Internal("workflow semaphore closed".into())
        })?;

        loop {
            if self.is_cancelled(workflow_id).await? {
                return Ok(());
            }
            let phase = self.current_phase(workflow_id).await?;
            match phase {
                Phase::Initialization => self.transition(workflow_id, Phase::Analysis, None).await?,
                Phase::Analysis => self.run_analysis(workflow_id).await?,
                Phase::Decomposition => self.run_decomposition(workflow_id).await?,
                Phase::Coordination => self.run_coordination(workflow_id).await?,
                Phase::Execution => self.run_execution(workflow_id).await?,
                Phase::Review => self.run_review(workflow_id).await?,
                Phase::Completion | Phase::Failed => return Ok(()),
                Phase::ErrorHandling => return Ok(()), // terminal step already applied by raise_failure
            }
        }
    }

    async fn is_cancelled(&self, workflow_id: WorkflowId) -> Result<bool> {
        let entry = self
            .runtimes
            .get(&workflow_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))?;
        Ok(entry.lock().await.cancelled)
    }

    async fn current_phase(&self, workflow_id: WorkflowId) -> Result<Phase> {
        let entry = self
            .runtimes
            .get(&workflow_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))?;
        Ok(entry.lock().await.workflow.phase)
    }

    /// Every transition is preceded by a checkpoint write; if the write
    /// fails, the transition is aborted and the workflow is marked degraded
    /// (spec.md §4.1, §7).
    async fn transition(&self, workflow_id: WorkflowId, to: Phase, raised_from: Option<Phase>) -> Result<()> {
        let entry = self
            .runtimes
            .get(&workflow_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {workflow_id}")))?;
        let mut runtime = entry.lock().await;
        Self::sync_subtasks(&mut runtime);
        runtime
            .workflow
            .transition(to, raised_from)
            .map_err(OrchestratorError::IllegalTransition)?;
        let snapshot = WorkflowSnapshot::from_workflow(&runtime.task, &runtime.workflow);
        let task_id = runtime.task.id;
        drop(runtime);
        self.snapshots.insert(workflow_id, snapshot.clone());

        if let Err(e) = self.checkpoint(workflow_id, vec![]).await {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.workflow.degraded = true;
            let snapshot = WorkflowSnapshot::from_workflow(&runtime.task, &runtime.workflow);
            drop(runtime);
            self.snapshots.insert(workflow_id, snapshot);
            return Err(e);
        }

        self.publish_completion_event(task_id, &snapshot).await;
        if to.is_terminal() {
            self.bus.deregister_recipient(&Self::workflow_inbox_id(workflow_id));
        }
        Ok(())
    }

    /// Publish a `{task_id, phase, status, payload?, timestamp}` event to the
    /// task's topic for `GET /tasks/:id/events` listeners (spec.md §6).
    async fn publish_completion_event(&self, task_id: TaskId, snapshot: &WorkflowSnapshot) {
        let payload = serde_json::json!({
            "task_id": task_id,
            "phase": snapshot.phase,
            "status": snapshot.status,
            "timestamp": chrono::Utc::now(),
        });
        let envelope = crate::models::envelope::Envelope::new(
            "engine",
            crate::models::envelope::Recipient::Topic(format!("task:{task_id}")),
            crate::models::envelope::MessageKind::TaskProgress,
            payload,
            self.config.retention_window(),
        );
        self.bus.publish(&format!("task:{task_id}"), envelope).await;
    }

    async fn run_analysis(&self, workflow_id: WorkflowId) -> Result<()> {
        let (title, description, input) = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let runtime = entry.lock().await;
            (runtime.task.title.clone(), runtime.task.description.clone(), runtime.task.input.clone())
        };

        let request = AnalyzeRequest { task_title: title, task_description: description, input };
        let outcome = tokio::time::timeout(self.config.llm_timeout(), self.llm.analyze(request)).await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.raise_failure(workflow_id, Phase::Analysis, e.failure_kind(), None, e.to_string()).await,
            Err(_) => return self.raise_failure(workflow_id, Phase::Analysis, FailureKind::LlmUnavailable, None, "analyze timed out".into()).await,
        };

        let decision = RecordedDecision::LlmAnalysis {
            complexity_score: response.complexity_score as f32,
            needs_decomposition: response.needs_decomposition,
        };
        self.checkpoint(workflow_id, vec![decision]).await?;

        let next = if response.needs_decomposition { Phase::Decomposition } else { Phase::Coordination };
        self.transition(workflow_id, next, None).await
    }

    async fn run_decomposition(&self, workflow_id: WorkflowId) -> Result<()> {
        let (title, description, input, parent_task_id, task_priority) = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let runtime = entry.lock().await;
            (
                runtime.task.title.clone(),
                runtime.task.description.clone(),
                runtime.task.input.clone(),
                runtime.task.id,
                runtime.task.priority.value(),
            )
        };

        let request = DecomposeRequest {
            task_title: title,
            task_description: description,
            input,
            subtask_count_ceiling: self.config.subtask_count_ceiling,
        };
        let outcome = tokio::time::timeout(self.config.llm_timeout(), self.llm.decompose(request)).await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.raise_failure(workflow_id, Phase::Decomposition, e.failure_kind(), None, e.to_string()).await,
            Err(_) => return self.raise_failure(workflow_id, Phase::Decomposition, FailureKind::LlmUnavailable, None, "decompose timed out".into()).await,
        };

        if response.subtasks.len() > self.config.subtask_count_ceiling {
            return self
                .raise_failure(workflow_id, Phase::Decomposition, FailureKind::ValidationFailed, None, "subtask ceiling exceeded".into())
                .await;
        }

        let mut subtasks: Vec<Subtask> = Vec::with_capacity(response.subtasks.len());
        for proposed in &response.subtasks {
            let caps: HashSet<String> = proposed.required_capabilities.iter().cloned().collect();
            // a decomposition may propose its own per-subtask priority; an
            // absent or out-of-range one falls back to the parent task's
            // declared priority (spec.md §4.4's priority-first ordering).
            let priority = proposed
                .priority
                .filter(|p| (1..=5).contains(p))
                .unwrap_or(task_priority);
            subtasks.push(Subtask::new(
                parent_task_id,
                proposed.title.clone(),
                proposed.description.clone(),
                caps,
                HashSet::new(),
                priority,
            ));
        }
        // resolve `depends_on` indices against the freshly generated IDs, now that every subtask exists
        for (i, proposed) in response.subtasks.iter().enumerate() {
            let deps: HashSet<_> = proposed.depends_on.iter().filter_map(|idx| subtasks.get(*idx).map(|s| s.id)).collect();
            subtasks[i].dependencies = deps;
        }

        if let Err(msg) = validate_acyclic(&subtasks) {
            return self.raise_failure(workflow_id, Phase::Decomposition, FailureKind::ValidationFailed, None, msg).await;
        }

        let known_capabilities: HashSet<String> =
            self.registry.snapshot().into_iter().flat_map(|a| a.capabilities).collect();
        for subtask in &subtasks {
            if !subtask.required_capabilities.is_empty()
                && subtask.required_capabilities.iter().all(|c| !known_capabilities.contains(c))
            {
                return self
                    .raise_failure(workflow_id, Phase::Decomposition, FailureKind::CapabilityMissing, Some(subtask.id), format!("no agent declares {:?}", subtask.required_capabilities))
                    .await;
            }
        }

        let decision = RecordedDecision::LlmDecomposition { raw_subtask_count: subtasks.len() };
        {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            for subtask in &subtasks {
                runtime.workflow.subtasks.insert(subtask.id, subtask.clone());
            }
            runtime.scheduler = Some(SchedulerRuntime::new(
                subtasks,
                self.config.per_workflow_parallelism,
                Arc::clone(&self.bus),
                Arc::clone(&self.registry),
                Self::workflow_inbox_id(workflow_id),
            ));
        }
        self.checkpoint(workflow_id, vec![decision]).await?;
        self.transition(workflow_id, Phase::Coordination, None).await
    }

    /// Binds subtasks to agents is really the scheduler's first dispatch
    /// pass; coordination here is a checkpointed no-op step for undecomposed
    /// tasks and a pass-through for decomposed ones (spec.md §2's control
    /// flow: `COORDINATION binds subtasks to agents via registry`).
    async fn run_coordination(&self, workflow_id: WorkflowId) -> Result<()> {
        self.transition(workflow_id, Phase::Execution, None).await
    }

    async fn run_execution(&self, workflow_id: WorkflowId) -> Result<()> {
        let has_scheduler = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            entry.lock().await.scheduler.is_some()
        };

        if !has_scheduler {
            // undecomposed task: the task itself is the one unit of work.
            return self.transition(workflow_id, Phase::Review, None).await;
        }

        loop {
            if self.is_cancelled(workflow_id).await? {
                return Ok(());
            }
            let dispatched = {
                let entry = self.runtimes.get(&workflow_id).unwrap();
                let mut runtime = entry.lock().await;
                runtime.scheduler.as_mut().unwrap().dispatch_ready(self.config.subtask_deadline_secs()).await
            };
            if !dispatched.is_empty() {
                info!(%workflow_id, count = dispatched.len(), "subtasks dispatched");
                // record which agent won each assignment so `resume` can
                // replay the same choice instead of re-rolling the tiebreak
                // against whatever load/last-assigned state it finds later
                // (spec.md §4.1's determinism-for-replay rule).
                let decisions = dispatched
                    .iter()
                    .map(|(subtask_id, agent_id)| RecordedDecision::AssignmentTiebreak {
                        subtask_id: *subtask_id,
                        chosen_agent: agent_id.to_string(),
                    })
                    .collect();
                self.checkpoint(workflow_id, decisions).await?;
            }

            let overdue = {
                let entry = self.runtimes.get(&workflow_id).unwrap();
                let runtime = entry.lock().await;
                runtime.scheduler.as_ref().unwrap().overdue()
            };
            for (subtask_id, attempts) in overdue {
                self.handle_subtask_timeout(workflow_id, subtask_id, attempts).await?;
            }
            if self.is_cancelled(workflow_id).await? {
                return Ok(());
            }

            let terminal = {
                let entry = self.runtimes.get(&workflow_id).unwrap();
                let runtime = entry.lock().await;
                runtime.scheduler.as_ref().unwrap().is_terminal()
            };

            match terminal {
                Some(SchedulerResult::AllCompleted) => return self.transition(workflow_id, Phase::Review, None).await,
                Some(SchedulerResult::Cancelled) => return Ok(()),
                Some(SchedulerResult::Failed { subtask_id, kind }) => {
                    return self
                        .raise_failure(workflow_id, Phase::Execution, kind, Some(subtask_id), format!("subtask {subtask_id} failed"))
                        .await;
                }
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// A subtask's dispatch deadline elapsed with no `task_response`. Unlike
    /// an LLM failure this never routes through the full `error_handling`
    /// phase: reassignment is a scheduler-local correction that the
    /// workflow's phase graph doesn't need to observe (spec.md §4.4's "the
    /// scheduler reassigns... workflow completes successfully").
    async fn handle_subtask_timeout(&self, workflow_id: WorkflowId, subtask_id: SubtaskId, attempts: u32) -> Result<()> {
        warn!(%workflow_id, %subtask_id, attempts, "subtask deadline elapsed with no response");
        let failure = Failure {
            workflow_id,
            kind: FailureKind::SubtaskTimeout,
            subtask_id: Some(subtask_id),
            failing_agent: None,
            attempts_so_far: attempts,
        };
        let budget = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let runtime = entry.lock().await;
            RecoveryBudget { used: runtime.workflow.recovery_actions_taken, limit: self.config.recovery_budget }
        };
        let action = RecoveryCoordinator::decide(&failure, &budget);

        let should_fail_workflow = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.workflow.recovery_actions_taken += 1;
            runtime.workflow.record_error(FailureKind::SubtaskTimeout, format!("subtask {subtask_id} timed out"));
            let scheduler = runtime.scheduler.as_mut().unwrap();
            match action {
                RecoveryAction::Reassign { .. } => {
                    scheduler.reassign(subtask_id);
                    false
                }
                _ => {
                    scheduler.timeout(subtask_id);
                    true
                }
            }
        };
        self.checkpoint(workflow_id, vec![]).await?;

        if should_fail_workflow {
            return self
                .raise_failure(workflow_id, Phase::Execution, FailureKind::SubtaskTimeout, Some(subtask_id), format!("subtask {subtask_id} exhausted reassignment attempts"))
                .await;
        }
        Ok(())
    }

    async fn run_review(&self, workflow_id: WorkflowId) -> Result<()> {
        let (output, rework_ceiling, attempts) = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let runtime = entry.lock().await;
            let output = if runtime.workflow.subtasks.is_empty() {
                runtime.task.input.clone()
            } else {
                let mut outputs = serde_json::Map::new();
                for subtask in runtime.workflow.subtasks.values() {
                    if let Some(out) = subtask.output.clone() {
                        outputs.insert(subtask.id.to_string(), out);
                    }
                }
                serde_json::Value::Object(outputs)
            };
            (output, self.config.review_rework_ceiling, runtime.workflow.review_attempts)
        };

        if !self.config.review_verification_enabled || output_is_acceptable(&output) {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.task.complete(output);
            drop(runtime);
            return self.transition(workflow_id, Phase::Completion, None).await;
        }

        if attempts >= rework_ceiling {
            return self.raise_failure(workflow_id, Phase::Review, FailureKind::ReviewExhausted, None, "rework ceiling exceeded".into()).await;
        }

        {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.workflow.review_attempts += 1;
        }
        self.transition(workflow_id, Phase::Execution, None).await
    }

    /// Route a failure into `error_handling`, consult the recovery
    /// coordinator, checkpoint the decision, and either loop back to the
    /// raising phase or escalate to `failed` (spec.md §4.1, §4.5).
    async fn raise_failure(&self, workflow_id: WorkflowId, raised_from: Phase, kind: FailureKind, subtask_id: Option<SubtaskId>, message: String) -> Result<()> {
        warn!(%workflow_id, ?kind, message, "workflow entering error_handling");
        self.transition(workflow_id, Phase::ErrorHandling, None).await?;

        let (budget, loops, loop_cap) = {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.workflow.record_error(kind, message.clone());
            runtime.workflow.error_handling_loops += 1;
            (
                RecoveryBudget { used: runtime.workflow.recovery_actions_taken, limit: self.config.recovery_budget },
                runtime.workflow.error_handling_loops,
                self.config.error_handling_loop_cap,
            )
        };

        if loops > loop_cap {
            return self.fail_workflow(workflow_id).await;
        }

        let failure = Failure { workflow_id, kind, subtask_id, failing_agent: None, attempts_so_far: 0 };
        let action = RecoveryCoordinator::decide(&failure, &budget);

        {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.workflow.recovery_actions_taken += 1;
        }
        self.checkpoint(workflow_id, vec![]).await?;

        match action {
            RecoveryAction::FailTask => self.fail_workflow(workflow_id).await,
            RecoveryAction::Quarantine => {
                let entry = self.runtimes.get(&workflow_id).unwrap();
                let mut runtime = entry.lock().await;
                runtime.workflow.quarantined = true;
                self.snapshots.insert(workflow_id, WorkflowSnapshot::from_workflow(&runtime.task, &runtime.workflow));
                drop(runtime);
                self.bus.deregister_recipient(&Self::workflow_inbox_id(workflow_id));
                Err(OrchestratorError::Quarantined(workflow_id.to_string()))
            }
            RecoveryAction::EmergencyAlert => {
                self.bus
                    .publish(
                        "emergency",
                        crate::models::envelope::Envelope::new(
                            "engine",
                            crate::models::envelope::Recipient::Topic("emergency".into()),
                            crate::models::envelope::MessageKind::EmergencyAlert,
                            serde_json::json!({"workflow_id": workflow_id, "kind": kind}),
                            chrono::Duration::minutes(10),
                        ),
                    )
                    .await;
                self.fail_workflow(workflow_id).await
            }
            RecoveryAction::RetryWithBackoff { .. } | RecoveryAction::Reassign { .. } | RecoveryAction::ReworkSignal => {
                self.transition(workflow_id, raised_from, Some(raised_from)).await
            }
            RecoveryAction::SurfaceCapabilityMissing { .. } | RecoveryAction::Escalate(_) => {
                self.fail_workflow(workflow_id).await
            }
        }
    }

    async fn fail_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        {
            let entry = self.runtimes.get(&workflow_id).unwrap();
            let mut runtime = entry.lock().await;
            runtime.task.fail();
        }
        self.transition(workflow_id, Phase::Failed, Some(Phase::ErrorHandling)).await
    }
}

/// Placeholder acceptance check for the optional review-verification pass —
/// always accepts. A real verification LLM call would replace this; §9's
/// open question gates the whole pass behind `review_verification_enabled`
/// rather than mandating a specific verifier.
fn output_is_acceptable(_output: &serde_json::Value) -> bool {
    true
}
