//! Wire types for the inbound/outbound JSON contracts — spec.md §6.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::WorkflowSnapshot;
use crate::models::task::TaskId;
use crate::PublicErrorCode;

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: u8,
    #[serde(default)]
    pub input: serde_json::Value,
    pub requester_id: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDocument {
    pub code: PublicErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub snapshot: WorkflowSnapshot,
}

#[derive(Debug, Serialize)]
pub struct CompletionEvent {
    pub task_id: TaskId,
    pub phase: crate::models::workflow::Phase,
    pub status: crate::models::task::TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}
