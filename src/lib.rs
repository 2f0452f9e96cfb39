// orcaforge - multi-agent task orchestration runtime

//! # orcaforge
//!
//! A single-process runtime that accepts user-submitted tasks, analyzes
//! their complexity through an external LLM oracle, decomposes complex ones
//! into a dependency DAG of subtasks, coordinates execution across a fleet
//! of heterogeneous agents, and reports results back through both
//! request/response and streaming channels.
//!
//! ## Layout
//!
//! - [`models`]: plain domain data — `Task`, `Workflow`, `Subtask`, `Agent`,
//!   `Envelope`, `Checkpoint`.
//! - [`bus`]: the process-internal pub/sub + request/reply message fabric.
//! - [`registry`]: agent registration, heartbeats, capability matching.
//! - [`engine`]: the per-task workflow state machine and its checkpointing.
//! - [`scheduler`]: topological dispatch of a subtask DAG.
//! - [`recovery`]: failure classification and strategy selection.
//! - [`llm`]: the narrow `Analyze`/`Decompose` adapter contract consumed by
//!   the engine, treating the LLM as an external oracle.
//! - [`persistence`]: the checkpoint log and key-value store, file-backed
//!   with a cache layer in front.
//! - [`config`]: the environment-variable configuration surface.
//! - [`api`]: the thin inbound/outbound HTTP surface.

pub mod api;
pub mod bus;
pub mod config;
pub mod engine;
pub mod llm;
pub mod models;
pub mod persistence;
pub mod recovery;
pub mod registry;
pub mod scheduler;

pub use config::RuntimeConfig;
pub use engine::WorkflowEngine;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The public, user-facing error taxonomy from spec.md §7. The detailed
/// internal kind (see [`recovery::FailureKind`]) remains available via
/// status queries but is never leaked into this smaller surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicErrorCode {
    InvalidInput,
    NotFound,
    Cancelled,
    FailedInternal,
    FailedExternal,
}

/// Internal error type for the whole crate. Every subsystem returns this via
/// [`Result`]; `#[from]` conversions keep `?` usable across module
/// boundaries the way the teacher's `CircuitBreakerError` does in its
/// library root.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("illegal phase transition: {0}")]
    IllegalTransition(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("workflow {0} is quarantined (corrupt checkpoint)")]
    Quarantined(String),

    #[error("recovery budget exhausted for workflow {0}")]
    RecoveryBudgetExhausted(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Collapse the detailed internal error into the small public taxonomy
    /// spec.md §7 requires ("detailed kind available via status query but
    /// not leaked into public codes").
    pub fn public_code(&self) -> PublicErrorCode {
        match self {
            OrchestratorError::InvalidInput(_) => PublicErrorCode::InvalidInput,
            OrchestratorError::NotFound(_) => PublicErrorCode::NotFound,
            OrchestratorError::Cancelled => PublicErrorCode::Cancelled,
            OrchestratorError::Persistence(_)
            | OrchestratorError::Bus(_)
            | OrchestratorError::Quarantined(_)
            | OrchestratorError::Internal(_)
            | OrchestratorError::RecoveryBudgetExhausted(_)
            | OrchestratorError::IllegalTransition(_)
            | OrchestratorError::Config(_)
            | OrchestratorError::Serialization(_) => PublicErrorCode::FailedInternal,
            OrchestratorError::Timeout(_) => PublicErrorCode::FailedExternal,
        }
    }
}

/// Type alias for results that use our custom error type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
