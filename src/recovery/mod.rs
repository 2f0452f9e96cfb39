//! Error recovery: failure classification and strategy selection.
//!
//! Grounded on the teacher's approach to typed, closed error taxonomies
//! (`CircuitBreakerError` in `lib.rs`) but scoped to spec.md §4.5's specific
//! failure kinds and strategy table. The coordinator is deliberately
//! stateless with respect to scheduler/registry/engine state — per spec.md
//! §5's mutation rules it only decides and checkpoints an action; applying
//! it is the owning component's job.

use serde::{Deserialize, Serialize};

use crate::models::agent::AgentId;
use crate::models::subtask::SubtaskId;
use crate::models::workflow::WorkflowId;

/// Closed taxonomy of failure kinds, spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientNetwork,
    AgentUnreachable,
    CapabilityMissing,
    SubtaskTimeout,
    LlmUnavailable,
    LlmMalformed,
    ValidationFailed,
    ReviewExhausted,
    CheckpointCorrupt,
    FatalInternal,
}

/// What the coordinator decided to do about a failure. The owning
/// component (scheduler, engine, registry) applies the action; the
/// coordinator's only side effect is recording the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecoveryAction {
    RetryWithBackoff { attempt: u32, max_attempts: u32 },
    Reassign { subtask_id: SubtaskId, exclude: Vec<AgentId> },
    SurfaceCapabilityMissing { subtask_id: SubtaskId },
    ReworkSignal,
    FailTask,
    Quarantine,
    EmergencyAlert,
    Escalate(FailureKind),
}

/// Default caps from spec.md §4.5's strategy table.
pub const TRANSIENT_NETWORK_MAX_ATTEMPTS: u32 = 3;
pub const SUBTASK_TIMEOUT_MAX_REASSIGNMENTS: u32 = 2;
pub const LLM_UNAVAILABLE_MAX_ATTEMPTS: u32 = 3;

/// Failure classification, carrying whatever context the strategy needs.
#[derive(Debug, Clone)]
pub struct Failure {
    pub workflow_id: WorkflowId,
    pub kind: FailureKind,
    pub subtask_id: Option<SubtaskId>,
    pub failing_agent: Option<AgentId>,
    pub attempts_so_far: u32,
}

/// Global recovery budget per workflow — exceeding it force-fails the
/// workflow as `fatal_internal` (spec.md §4.5, §7, §8 property #6).
#[derive(Debug, Clone, Copy)]
pub struct RecoveryBudget {
    pub used: u32,
    pub limit: u32,
}

impl RecoveryBudget {
    pub fn new(limit: u32) -> Self {
        Self { used: 0, limit }
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn consume(&mut self) {
        self.used += 1;
    }
}

/// Stateless strategy table: failure kind + context -> recovery action.
/// This is the one authoritative place spec.md §4.5's table is encoded.
pub struct RecoveryCoordinator;

impl RecoveryCoordinator {
    pub fn decide(failure: &Failure, budget: &RecoveryBudget) -> RecoveryAction {
        if budget.exhausted() {
            return RecoveryAction::FailTask;
        }

        match failure.kind {
            FailureKind::TransientNetwork => {
                if failure.attempts_so_far >= TRANSIENT_NETWORK_MAX_ATTEMPTS {
                    RecoveryAction::FailTask
                } else {
                    RecoveryAction::RetryWithBackoff {
                        attempt: failure.attempts_so_far + 1,
                        max_attempts: TRANSIENT_NETWORK_MAX_ATTEMPTS,
                    }
                }
            }
            FailureKind::AgentUnreachable => match failure.subtask_id {
                Some(subtask_id) => RecoveryAction::Reassign {
                    subtask_id,
                    exclude: failure.failing_agent.clone().into_iter().collect(),
                },
                None => RecoveryAction::Escalate(FailureKind::CapabilityMissing),
            },
            FailureKind::CapabilityMissing => {
                let subtask_id = failure.subtask_id.expect("capability_missing always names a subtask");
                RecoveryAction::SurfaceCapabilityMissing { subtask_id }
            }
            FailureKind::SubtaskTimeout => {
                let subtask_id = failure.subtask_id.expect("subtask_timeout always names a subtask");
                if failure.attempts_so_far >= SUBTASK_TIMEOUT_MAX_REASSIGNMENTS {
                    RecoveryAction::FailTask
                } else {
                    RecoveryAction::Reassign { subtask_id, exclude: vec![] }
                }
            }
            FailureKind::LlmUnavailable => {
                if failure.attempts_so_far >= LLM_UNAVAILABLE_MAX_ATTEMPTS {
                    RecoveryAction::FailTask
                } else {
                    RecoveryAction::RetryWithBackoff {
                        attempt: failure.attempts_so_far + 1,
                        max_attempts: LLM_UNAVAILABLE_MAX_ATTEMPTS,
                    }
                }
            }
            FailureKind::LlmMalformed => {
                if failure.attempts_so_far >= 1 {
                    RecoveryAction::FailTask
                } else {
                    RecoveryAction::RetryWithBackoff { attempt: 1, max_attempts: 1 }
                }
            }
            FailureKind::ValidationFailed => RecoveryAction::ReworkSignal,
            FailureKind::ReviewExhausted => RecoveryAction::FailTask,
            FailureKind::CheckpointCorrupt => RecoveryAction::Quarantine,
            FailureKind::FatalInternal => RecoveryAction::EmergencyAlert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FailureKind, attempts: u32) -> Failure {
        Failure {
            workflow_id: WorkflowId::new(),
            kind,
            subtask_id: Some(SubtaskId::new()),
            failing_agent: Some(AgentId::from("agent-1")),
            attempts_so_far: attempts,
        }
    }

    #[test]
    fn transient_network_retries_then_fails() {
        let budget = RecoveryBudget::new(10);
        for n in 0..TRANSIENT_NETWORK_MAX_ATTEMPTS {
            let action = RecoveryCoordinator::decide(&failure(FailureKind::TransientNetwork, n), &budget);
            assert!(matches!(action, RecoveryAction::RetryWithBackoff { .. }));
        }
        let action = RecoveryCoordinator::decide(
            &failure(FailureKind::TransientNetwork, TRANSIENT_NETWORK_MAX_ATTEMPTS),
            &budget,
        );
        assert!(matches!(action, RecoveryAction::FailTask));
    }

    #[test]
    fn exhausted_budget_always_fails() {
        let mut budget = RecoveryBudget::new(1);
        budget.consume();
        assert!(budget.exhausted());
        let action = RecoveryCoordinator::decide(&failure(FailureKind::TransientNetwork, 0), &budget);
        assert!(matches!(action, RecoveryAction::FailTask));
    }

    #[test]
    fn subtask_timeout_reassigns_then_fails() {
        let budget = RecoveryBudget::new(10);
        let action = RecoveryCoordinator::decide(&failure(FailureKind::SubtaskTimeout, 0), &budget);
        assert!(matches!(action, RecoveryAction::Reassign { .. }));
        let action = RecoveryCoordinator::decide(
            &failure(FailureKind::SubtaskTimeout, SUBTASK_TIMEOUT_MAX_REASSIGNMENTS),
            &budget,
        );
        assert!(matches!(action, RecoveryAction::FailTask));
    }

    #[test]
    fn checkpoint_corrupt_always_quarantines() {
        let budget = RecoveryBudget::new(10);
        let action = RecoveryCoordinator::decide(&failure(FailureKind::CheckpointCorrupt, 0), &budget);
        assert!(matches!(action, RecoveryAction::Quarantine));
    }
}
