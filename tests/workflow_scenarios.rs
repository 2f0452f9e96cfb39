//! End-to-end scenario tests for spec.md §8's six literal scenarios, driving
//! the public `WorkflowEngine` surface against in-memory bus/registry/
//! persistence doubles and a scripted fake-agent harness in place of real
//! agent processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use orcaforge::bus::MessageBus;
use orcaforge::config::RuntimeConfig;
use orcaforge::llm::{
    AnalyzeRequest, AnalyzeResponse, DecomposeRequest, DecomposeResponse, LlmAdapter, LlmError,
    ProposedSubtask, StubLlmAdapter,
};
use orcaforge::models::agent::{AgentDescriptor, AgentId};
use orcaforge::models::envelope::{Envelope, MessageKind, Recipient};
use orcaforge::models::task::{Task, TaskStatus};
use orcaforge::persistence::{InMemoryPersistence, SharedPersistence};
use orcaforge::registry::AgentRegistry;
use orcaforge::{OrchestratorError, WorkflowEngine};

/// Wait for `check` to return `Some` against fresh `GetStatus` polls,
/// panicking if it hasn't within a generous bound — every scenario below
/// runs entirely in-process with no real network latency, so this should
/// resolve in well under a second.
async fn poll_until<T>(
    mut check: impl FnMut() -> Option<T>,
    timeout: Duration,
) -> T {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn task(title: &str, description: &str, priority: u8, input: serde_json::Value) -> Task {
    Task::new(
        title.to_string(),
        description.to_string(),
        "generic".to_string(),
        priority,
        input,
        "requester-1".to_string(),
        HashMap::new(),
        None,
    )
    .unwrap()
}

fn register_agent(registry: &AgentRegistry, bus: &MessageBus, id: &str, capabilities: &[&str]) {
    let agent_id = AgentId::from(id);
    registry.register(AgentDescriptor {
        id: agent_id.clone(),
        agent_type: "worker".into(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        max_concurrent_slots: 4,
    });
    registry.heartbeat(&agent_id, 0).unwrap();
    bus.register_recipient(agent_id);
}

/// Spawn a fake agent that echoes its `input` as every subtask's output,
/// completing every `task_request` it receives. Mirrors a well-behaved
/// worker process.
fn spawn_echoing_agent(bus: Arc<MessageBus>, id: &str) {
    let agent_id = AgentId::from(id);
    let mut receiver = bus.register_recipient(agent_id.clone());
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            if envelope.kind != MessageKind::TaskRequest {
                continue;
            }
            let Some(reply_to) = envelope.payload.get("reply_to").and_then(|v| v.as_str()) else { continue };
            let subtask_id = envelope.payload.get("subtask_id").cloned().unwrap_or(serde_json::Value::Null);
            let response = Envelope::new(
                agent_id.as_str(),
                Recipient::Agent(AgentId::from(reply_to)),
                MessageKind::TaskResponse,
                serde_json::json!({
                    "subtask_id": subtask_id,
                    "status": "completed",
                    "output": {"echoed_by": agent_id.as_str()},
                }),
                chrono::Duration::seconds(30),
            );
            let _ = bus.send(&AgentId::from(reply_to), response).await;
        }
    });
}

/// A fake agent that never replies — simulates an unresponsive/crashed agent
/// for the deadline-driven reassignment scenario. It still drains its inbox
/// (so `Send` doesn't fail) but produces no `task_response`.
fn spawn_silent_agent(bus: Arc<MessageBus>, id: &str) {
    let mut receiver = bus.register_recipient(AgentId::from(id));
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });
}

fn test_engine(
    config: RuntimeConfig,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    persistence: SharedPersistence,
    llm: Arc<dyn LlmAdapter>,
) -> Arc<WorkflowEngine> {
    WorkflowEngine::new(Arc::new(config), bus, registry, persistence, llm)
}

// ---------------------------------------------------------------------
// Scenario 1: trivial task, no decomposition.
// ---------------------------------------------------------------------

#[tokio::test]
async fn trivial_task_completes_without_decomposition() {
    let bus = Arc::new(MessageBus::new(64));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    register_agent(&registry, &bus, "echo-agent", &["echo"]);
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(StubLlmAdapter { always_decompose: false });

    let engine = test_engine(RuntimeConfig::default(), bus, registry, persistence, llm);
    let input = serde_json::json!({"msg": "hi"});
    let submitted = task("echo", "return input", 3, input.clone());
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    let snapshot = poll_until(
        || {
            let s = engine.get_status_by_task(task_id).ok()?;
            s.status.is_terminal().then_some(s)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert!(snapshot.subtasks.is_empty(), "a trivial task never decomposes");
    assert_eq!(snapshot.progress, 1.0);
}

// ---------------------------------------------------------------------
// Scenario 2: decomposed task, dependent subtasks dispatched in order.
// ---------------------------------------------------------------------

#[tokio::test]
async fn decomposed_task_dispatches_dependent_subtask_only_after_its_dependency_completes() {
    let bus = Arc::new(MessageBus::new(64));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    register_agent(&registry, &bus, "analyzer", &["analyze"]);
    register_agent(&registry, &bus, "writer", &["write"]);
    spawn_echoing_agent(Arc::clone(&bus), "analyzer");
    spawn_echoing_agent(Arc::clone(&bus), "writer");
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(TwoStepLlm);

    let engine = test_engine(RuntimeConfig::default(), bus, registry, persistence, llm);
    let submitted = task("build-report", "analyze then write", 2, serde_json::json!({}));
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    let snapshot = poll_until(
        || {
            let s = engine.get_status_by_task(task_id).ok()?;
            s.status.is_terminal().then_some(s)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.subtasks.len(), 2);
    assert!(snapshot.subtasks.iter().all(|s| s.status == TaskStatus::Completed));
}

/// Returns `needs_decomposition = true` and two subtasks, `B` depending on
/// `A`, matching spec.md §8 scenario 2 exactly.
struct TwoStepLlm;

#[async_trait]
impl LlmAdapter for TwoStepLlm {
    async fn analyze(&self, _request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError> {
        Ok(AnalyzeResponse { complexity_score: 0.9, needs_decomposition: true, rationale: None })
    }

    async fn decompose(&self, _request: DecomposeRequest) -> Result<DecomposeResponse, LlmError> {
        Ok(DecomposeResponse {
            subtasks: vec![
                ProposedSubtask {
                    title: "A".into(),
                    description: "analyze".into(),
                    required_capabilities: vec!["analyze".into()],
                    depends_on: vec![],
                },
                ProposedSubtask {
                    title: "B".into(),
                    description: "write".into(),
                    required_capabilities: vec!["write".into()],
                    depends_on: vec![0],
                },
            ],
        })
    }
}

// ---------------------------------------------------------------------
// Scenario 3: agent failure triggers deadline-driven reassignment.
// ---------------------------------------------------------------------

#[tokio::test]
async fn unresponsive_agent_causes_reassignment_and_eventual_completion() {
    let bus = Arc::new(MessageBus::new(64));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    // "flaky" never replies; "steady" always does. Register flaky first so
    // it wins the initial dispatch (equal load, earlier registration).
    register_agent(&registry, &bus, "flaky", &[]);
    register_agent(&registry, &bus, "steady", &[]);
    spawn_silent_agent(Arc::clone(&bus), "flaky");
    spawn_echoing_agent(Arc::clone(&bus), "steady");

    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(StubLlmAdapter::default());
    // A near-zero deadline means the very first dispatch is already overdue
    // by the next poll tick, without the test waiting out a real 60s T_hb.
    let mut config = RuntimeConfig::default();
    config.subtask_deadline_secs = 0;

    let engine = test_engine(config, bus, registry, persistence, llm);
    let submitted = task("flaky-run", "one subtask, one flaky agent", 3, serde_json::json!({}));
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    let snapshot = poll_until(
        || {
            let s = engine.get_status_by_task(task_id).ok()?;
            s.status.is_terminal().then_some(s)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    // the reassigned subtask was dispatched twice: once to the flaky agent
    // that never answers, once more to the steady one that finishes it
    let retried = snapshot.subtasks.iter().find(|s| s.attempts == 2);
    assert!(retried.is_some(), "expected the reassigned subtask to show attempts == 2");
}

// ---------------------------------------------------------------------
// Scenario 4: cancellation mid-flight.
// ---------------------------------------------------------------------

#[tokio::test]
async fn cancellation_preserves_completed_output_and_skips_undispatched_subtasks() {
    let bus = Arc::new(MessageBus::new(64));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    register_agent(&registry, &bus, "worker", &[]);
    spawn_echoing_agent(Arc::clone(&bus), "worker");

    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(FourStepChainLlm);
    let mut config = RuntimeConfig::default();
    config.per_workflow_parallelism = 1; // force strictly sequential dispatch

    let engine = test_engine(config, bus, registry, persistence, llm);
    let submitted = task("four-step", "sequential chain of 4", 3, serde_json::json!({}));
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    // Wait until exactly one subtask has completed (subtask 1 of 4), then
    // cancel while subtask 2 is in flight.
    poll_until(
        || {
            let s = engine.get_status_by_task(task_id).ok()?;
            let completed = s.subtasks.iter().filter(|st| st.status == TaskStatus::Completed).count();
            (completed >= 1).then_some(())
        },
        Duration::from_secs(2),
    )
    .await;

    let snapshot = engine.cancel_task_by_id(task_id).await.unwrap();

    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    let completed = snapshot.subtasks.iter().filter(|s| s.status == TaskStatus::Completed).count();
    let cancelled = snapshot.subtasks.iter().filter(|s| s.status == TaskStatus::Cancelled).count();
    assert!(completed >= 1, "subtask 1's output survives cancellation");
    assert!(cancelled >= 1, "never-dispatched subtasks are cancelled, not silently dropped");
    assert_eq!(completed + cancelled, snapshot.subtasks.len());

    // Idempotent: re-cancelling a terminal workflow is a no-op.
    let second = engine.cancel_task_by_id(task_id).await.unwrap();
    assert_eq!(second.status, TaskStatus::Cancelled);
}

/// Four subtasks chained A -> B -> C -> D, no capability requirements.
struct FourStepChainLlm;

#[async_trait]
impl LlmAdapter for FourStepChainLlm {
    async fn analyze(&self, _request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError> {
        Ok(AnalyzeResponse { complexity_score: 0.9, needs_decomposition: true, rationale: None })
    }

    async fn decompose(&self, _request: DecomposeRequest) -> Result<DecomposeResponse, LlmError> {
        Ok(DecomposeResponse {
            subtasks: (0..4)
                .map(|i| ProposedSubtask {
                    title: format!("step-{i}"),
                    description: "chain step".into(),
                    required_capabilities: vec![],
                    depends_on: if i == 0 { vec![] } else { vec![i - 1] },
                })
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------
// Scenario 5: LLM unavailable during analysis.
// ---------------------------------------------------------------------

struct AlwaysTimesOutLlm;

#[async_trait]
impl LlmAdapter for AlwaysTimesOutLlm {
    async fn analyze(&self, _request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError> {
        Err(LlmError::Timeout)
    }

    async fn decompose(&self, _request: DecomposeRequest) -> Result<DecomposeResponse, LlmError> {
        Err(LlmError::Timeout)
    }
}

#[tokio::test]
async fn llm_unavailable_during_analysis_fails_the_workflow_without_dispatching_subtasks() {
    let bus = Arc::new(MessageBus::new(64));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(AlwaysTimesOutLlm);
    let mut config = RuntimeConfig::default();
    config.llm_timeout_secs = 1;
    config.error_handling_loop_cap = 2;

    let engine = test_engine(config, bus, registry, persistence, llm);
    let submitted = task("unreachable-llm", "analysis never succeeds", 3, serde_json::json!({}));
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    let snapshot = poll_until(
        || {
            let s = engine.get_status_by_task(task_id).ok()?;
            s.status.is_terminal().then_some(s)
        },
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert!(snapshot.subtasks.is_empty(), "analysis never got far enough to decompose or dispatch");
    let last_error = snapshot.last_error.expect("a failed workflow always records its last error");
    assert!(matches!(last_error.kind, orcaforge::recovery::FailureKind::LlmUnavailable));
}

// ---------------------------------------------------------------------
// Scenario 6: resume after restart.
// ---------------------------------------------------------------------

#[tokio::test]
async fn resume_continues_from_last_checkpoint_without_redispatching_completed_subtasks() {
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());

    // "Process A": one agent that completes the first subtask and then goes
    // silent, standing in for a crash mid-execution on the second.
    let bus_a = Arc::new(MessageBus::new(64));
    let registry_a = Arc::new(AgentRegistry::new(Arc::clone(&bus_a), chrono::Duration::seconds(3600)));
    register_agent(&registry_a, &bus_a, "worker-1", &[]);
    spawn_half_answering_agent(Arc::clone(&bus_a), "worker-1");

    let mut config_a = RuntimeConfig::default();
    config_a.subtask_deadline_secs = 3600; // never let process A's own loop time out mid-test
    let llm: Arc<dyn LlmAdapter> = Arc::new(StubLlmAdapter::default());
    let engine_a = test_engine(config_a, Arc::clone(&bus_a), registry_a, Arc::clone(&persistence), llm);

    let submitted = task("resumable", "two independent subtasks", 3, serde_json::json!({}));
    let task_id = submitted.id;
    let workflow_id = engine_a.submit_task(submitted).await.unwrap();

    // Wait until exactly one of the two subtasks has completed and the other
    // is dispatched (in_progress) but will never hear back on process A.
    poll_until(
        || {
            let s = engine_a.get_status_by_task(task_id).ok()?;
            let completed = s.subtasks.iter().filter(|st| st.status == TaskStatus::Completed).count();
            let in_progress = s.subtasks.iter().filter(|st| st.status == TaskStatus::InProgress).count();
            (completed == 1 && in_progress == 1).then_some(())
        },
        Duration::from_secs(2),
    )
    .await;

    // "restart": a fresh engine over the same durable persistence, with its
    // own bus/registry/agents standing in for a new process.
    let bus_b = Arc::new(MessageBus::new(64));
    let registry_b = Arc::new(AgentRegistry::new(Arc::clone(&bus_b), chrono::Duration::seconds(60)));
    register_agent(&registry_b, &bus_b, "worker-1", &[]);
    spawn_echoing_agent(Arc::clone(&bus_b), "worker-1");
    let llm_b: Arc<dyn LlmAdapter> = Arc::new(StubLlmAdapter::default());
    let engine_b = test_engine(RuntimeConfig::default(), bus_b, registry_b, Arc::clone(&persistence), llm_b);

    engine_b.resume(workflow_id).await.unwrap();

    let snapshot = poll_until(
        || {
            let s = engine_b.get_status(workflow_id).ok()?;
            s.status.is_terminal().then_some(s)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.subtasks.len(), 2);
    assert!(snapshot.subtasks.iter().all(|s| s.status == TaskStatus::Completed));
}

/// Completes only the first `task_request` it ever sees (by title containing
/// "part 1"); every subsequent request is silently dropped, simulating a
/// process that crashed right after finishing its first unit of work.
fn spawn_half_answering_agent(bus: Arc<MessageBus>, id: &str) {
    let agent_id = AgentId::from(id);
    let mut receiver = bus.register_recipient(agent_id.clone());
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            if envelope.kind != MessageKind::TaskRequest {
                continue;
            }
            let title = envelope.payload.get("title").and_then(|v| v.as_str()).unwrap_or("");
            if !title.contains("part 1") {
                continue; // simulate the crash: never reply to the second subtask
            }
            let Some(reply_to) = envelope.payload.get("reply_to").and_then(|v| v.as_str()) else { continue };
            let subtask_id = envelope.payload.get("subtask_id").cloned().unwrap_or(serde_json::Value::Null);
            let response = Envelope::new(
                agent_id.as_str(),
                Recipient::Agent(AgentId::from(reply_to)),
                MessageKind::TaskResponse,
                serde_json::json!({"subtask_id": subtask_id, "status": "completed", "output": {}}),
                chrono::Duration::seconds(30),
            );
            let _ = bus.send(&AgentId::from(reply_to), response).await;
        }
    });
}

// ---------------------------------------------------------------------
// Round-trip law: SubmitTask -> CancelTask -> GetStatus, re-cancel is a no-op
// (spec.md §8).
// ---------------------------------------------------------------------

#[tokio::test]
async fn cancel_before_any_progress_is_immediately_terminal() {
    let bus = Arc::new(MessageBus::new(16));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(StubLlmAdapter { always_decompose: false });
    let engine = test_engine(RuntimeConfig::default(), bus, registry, persistence, llm);

    let submitted = task("short-lived", "cancel immediately", 3, serde_json::json!({}));
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    let snapshot = engine.cancel_task_by_id(task_id).await.unwrap();
    assert_eq!(snapshot.status, TaskStatus::Cancelled);

    let again = engine.cancel_task_by_id(task_id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Cancelled);
}

// ---------------------------------------------------------------------
// Boundary behavior: priority outside 1..=5 is rejected before a workflow
// ever opens (spec.md §8).
// ---------------------------------------------------------------------

#[test]
fn out_of_range_priority_is_rejected_at_task_construction() {
    let err = Task::new(
        "t".into(),
        "d".into(),
        "generic".into(),
        0,
        serde_json::json!({}),
        "requester-1".into(),
        HashMap::new(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput(_)));
}

// ---------------------------------------------------------------------
// Boundary behavior: a subtask whose required capabilities match zero
// registered agents surfaces `capability_missing` rather than stalling
// silently (spec.md §8, §4.1's decomposition validation).
// ---------------------------------------------------------------------

struct UnsatisfiableCapabilityLlm;

#[async_trait]
impl LlmAdapter for UnsatisfiableCapabilityLlm {
    async fn analyze(&self, _request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError> {
        Ok(AnalyzeResponse { complexity_score: 0.9, needs_decomposition: true, rationale: None })
    }

    async fn decompose(&self, _request: DecomposeRequest) -> Result<DecomposeResponse, LlmError> {
        Ok(DecomposeResponse {
            subtasks: vec![ProposedSubtask {
                title: "needs-a-unicorn".into(),
                description: "no agent declares this".into(),
                required_capabilities: vec!["unicorn-whispering".into()],
                depends_on: vec![],
            }],
        })
    }
}

#[tokio::test]
async fn subtask_with_unsatisfiable_capability_fails_the_workflow() {
    let bus = Arc::new(MessageBus::new(16));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&bus), chrono::Duration::seconds(60)));
    register_agent(&registry, &bus, "generalist", &["analyze"]); // doesn't cover "unicorn-whispering"
    let persistence: SharedPersistence = Arc::new(InMemoryPersistence::new());
    let llm: Arc<dyn LlmAdapter> = Arc::new(UnsatisfiableCapabilityLlm);
    let mut config = RuntimeConfig::default();
    config.error_handling_loop_cap = 1;

    let engine = test_engine(config, bus, registry, persistence, llm);
    let submitted = task("impossible", "no agent can do this", 3, serde_json::json!({}));
    let task_id = submitted.id;
    engine.submit_task(submitted).await.unwrap();

    let snapshot = poll_until(
        || {
            let s = engine.get_status_by_task(task_id).ok()?;
            s.status.is_terminal().then_some(s)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(snapshot.status, TaskStatus::Failed);
    let last_error = snapshot.last_error.expect("a failed workflow always records its last error");
    assert!(matches!(last_error.kind, orcaforge::recovery::FailureKind::CapabilityMissing));
}
