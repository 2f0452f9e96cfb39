//! Runtime configuration surface — spec.md §6: environment-variable
//! overrides for every tunable named across the spec, with the documented
//! defaults as a fallback layer. Uses the `config` crate's `Environment`
//! source layered over in-code defaults, the idiomatic Rust analogue of the
//! teacher's direct `std::env::var(..).unwrap_or_else(..)` reads in
//! `bin/server.rs`, generalized here into one typed struct so every
//! subsystem reads tunables from a single place instead of scattering
//! `env::var` calls through the codebase.

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Global cap on concurrently-running workflows (spec.md §5).
    pub max_parallel_workflows: usize,
    /// Per-workflow subtask parallelism cap (spec.md §4.4).
    pub per_workflow_parallelism: usize,
    /// Seconds before a silent agent becomes `unreachable` (spec.md §3, T_hb).
    pub heartbeat_timeout_secs: u64,
    /// Seconds before an `Analyze`/`Decompose` call is treated as a timeout.
    pub llm_timeout_secs: u64,
    /// Seconds a dispatched subtask may run with no `task_response` before its
    /// deadline elapses and recovery decides retry-vs-fail (spec.md §4.4).
    pub subtask_deadline_secs: u64,
    /// Recovery actions permitted per workflow before force-failing it.
    pub recovery_budget: u32,
    /// Maximum subtasks a decomposition may propose.
    pub subtask_count_ceiling: usize,
    /// Hours outbound completion events are retained for cursor-based resend.
    pub checkpoint_retention_days: u32,
    /// Error-handling loop cap per phase (spec.md §3's `K`, default 3).
    pub error_handling_loop_cap: u32,
    /// Rework ceiling in the review phase before escalating (spec.md §4.1).
    pub review_rework_ceiling: u32,
    /// Default bounded inbox capacity for bus recipients (spec.md §4.2).
    pub inbox_capacity: usize,
    /// Gate for the optional review-phase verification pass (spec.md §9).
    pub review_verification_enabled: bool,
    /// Path to the SQLite-backed persistence file.
    pub database_path: String,
    /// Host/port the thin HTTP surface binds to.
    pub server_host: String,
    pub server_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_workflows: 64,
            per_workflow_parallelism: 8,
            heartbeat_timeout_secs: 60,
            llm_timeout_secs: 30,
            subtask_deadline_secs: 300,
            recovery_budget: 10,
            subtask_count_ceiling: 64,
            checkpoint_retention_days: 1, // retention window is 1h; see `retention_window`
            error_handling_loop_cap: 3,
            review_rework_ceiling: 2,
            inbox_capacity: 1024,
            review_verification_enabled: true,
            database_path: "orcaforge.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
        }
    }
}

impl RuntimeConfig {
    /// Load defaults overlaid with `ORCAFORGE_*` environment variables.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let builder = ::config::Config::builder()
            .set_default("max_parallel_workflows", defaults.max_parallel_workflows as i64)?
            .set_default("per_workflow_parallelism", defaults.per_workflow_parallelism as i64)?
            .set_default("heartbeat_timeout_secs", defaults.heartbeat_timeout_secs as i64)?
            .set_default("llm_timeout_secs", defaults.llm_timeout_secs as i64)?
            .set_default("subtask_deadline_secs", defaults.subtask_deadline_secs as i64)?
            .set_default("recovery_budget", defaults.recovery_budget as i64)?
            .set_default("subtask_count_ceiling", defaults.subtask_count_ceiling as i64)?
            .set_default("checkpoint_retention_days", defaults.checkpoint_retention_days as i64)?
            .set_default("error_handling_loop_cap", defaults.error_handling_loop_cap as i64)?
            .set_default("review_rework_ceiling", defaults.review_rework_ceiling as i64)?
            .set_default("inbox_capacity", defaults.inbox_capacity as i64)?
            .set_default("review_verification_enabled", defaults.review_verification_enabled)?
            .set_default("database_path", defaults.database_path.clone())?
            .set_default("server_host", defaults.server_host.clone())?
            .set_default("server_port", defaults.server_port as i64)?
            .add_source(::config::Environment::with_prefix("ORCAFORGE"));

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    /// Half of `heartbeat_timeout` — the point at which a still-heartbeating
    /// agent is flagged `degraded` rather than `unreachable` (spec.md §3).
    pub fn degraded_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64 / 2)
    }

    pub fn llm_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn subtask_deadline_secs(&self) -> i64 {
        self.subtask_deadline_secs as i64
    }

    /// Outbound completion events are retained for resend within this
    /// window — spec.md §6 default 1h, independent of the checkpoint
    /// retention tunable above.
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::hours(1)
    }
}
