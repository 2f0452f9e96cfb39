//! The LLM adapter boundary: `Analyze` and `Decompose` (spec.md §4.6), kept
//! behind a trait so the engine never depends on a concrete provider.
//!
//! Grounded on the teacher's multi-provider `LlmProvider` trait
//! (`engine/llm/provider.rs`) but narrowed to the two operations spec.md
//! actually names, with the provider's cost/routing machinery dropped. The
//! HTTP implementation uses `reqwest`, the teacher's own HTTP client;
//! malformed-response tolerance is handled by deserializing into a
//! permissive intermediate shape rather than rejecting unknown fields
//! (SPEC_FULL.md's Open Question decision on LLM schema tolerance).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::recovery::FailureKind;

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeRequest {
    pub task_title: String,
    pub task_description: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeResponse {
    pub complexity_score: f64,
    pub needs_decomposition: bool,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecomposeRequest {
    pub task_title: String,
    pub task_description: String,
    pub input: serde_json::Value,
    pub subtask_count_ceiling: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposedSubtask {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Override for the subtask's scheduling priority (1 highest, 5 lowest).
    /// Falls back to the parent task's declared priority when absent or out
    /// of range.
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecomposeResponse {
    pub subtasks: Vec<ProposedSubtask>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request timed out")]
    Timeout,
    #[error("llm provider unavailable: {0}")]
    Unavailable(String),
    #[error("llm response did not parse: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            LlmError::Timeout | LlmError::Unavailable(_) => FailureKind::LlmUnavailable,
            LlmError::Malformed(_) => FailureKind::LlmMalformed,
        }
    }
}

/// Bounded by the caller's `llm_timeout` for every call (spec.md §4.6).
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError>;
    async fn decompose(&self, request: DecomposeRequest) -> Result<DecomposeResponse, LlmError>;
}

/// HTTP-backed adapter against an OpenAI-compatible chat completions
/// endpoint, the shape the teacher's `OpenAiProvider` already targets.
pub struct HttpLlmAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl HttpLlmAdapter {
    pub fn new(endpoint: String, api_key: String, model: String, timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), endpoint, api_key, model, timeout }
    }

    async fn chat(&self, system: &str, user: serde_json::Value) -> Result<serde_json::Value, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user.to_string()},
            ],
            "response_format": {"type": "json_object"},
        });

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| LlmError::Timeout)?
        .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Unavailable(format!("status {}", response.status())));
        }

        let value: serde_json::Value =
            response.json().await.map_err(|e| LlmError::Malformed(e.to_string()))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".into()))?;
        serde_json::from_str(content).map_err(|e| LlmError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl LlmAdapter for HttpLlmAdapter {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError> {
        let system = "Return JSON {complexity_score: number 0..1, needs_decomposition: bool, rationale?: string}.";
        let value = self
            .chat(system, serde_json::json!({"title": request.task_title, "description": request.task_description, "input": request.input}))
            .await?;
        serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))
    }

    async fn decompose(&self, request: DecomposeRequest) -> Result<DecomposeResponse, LlmError> {
        let system = "Return JSON {subtasks: [{title, description, required_capabilities?: string[], depends_on?: number[], priority?: number 1-5}]}.";
        let value = self
            .chat(
                system,
                serde_json::json!({
                    "title": request.task_title,
                    "description": request.task_description,
                    "input": request.input,
                    "max_subtasks": request.subtask_count_ceiling,
                }),
            )
            .await?;
        let parsed: DecomposeResponse =
            serde_json::from_value(value).map_err(|e| LlmError::Malformed(e.to_string()))?;
        if parsed.subtasks.len() > request.subtask_count_ceiling {
            return Err(LlmError::Malformed("subtask_count_ceiling exceeded".into()));
        }
        Ok(parsed)
    }
}

/// Deterministic in-memory adapter for tests and `admin`'s dry-run mode:
/// always recommends decomposition into two subtasks with no dependencies,
/// never fails, never times out.
pub struct StubLlmAdapter {
    pub always_decompose: bool,
}

impl Default for StubLlmAdapter {
    fn default() -> Self {
        Self { always_decompose: true }
    }
}

#[async_trait]
impl LlmAdapter for StubLlmAdapter {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse, LlmError> {
        Ok(AnalyzeResponse {
            complexity_score: if self.always_decompose { 0.8 } else { 0.1 },
            needs_decomposition: self.always_decompose,
            rationale: Some(format!("stub analysis of {}", request.task_title)),
        })
    }

    async fn decompose(&self, request: DecomposeRequest) -> Result<DecomposeResponse, LlmError> {
        Ok(DecomposeResponse {
            subtasks: vec![
                ProposedSubtask {
                    title: format!("{} - part 1", request.task_title),
                    description: "stub-generated subtask".into(),
                    required_capabilities: vec![],
                    depends_on: vec![],
                    priority: None,
                },
                ProposedSubtask {
                    title: format!("{} - part 2", request.task_title),
                    description: "stub-generated subtask".into(),
                    required_capabilities: vec![],
                    depends_on: vec![0],
                    priority: None,
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_decompose_respects_declared_dependency() {
        let adapter = StubLlmAdapter::default();
        let response = adapter
            .decompose(DecomposeRequest {
                task_title: "build a thing".into(),
                task_description: "d".into(),
                input: serde_json::json!({}),
                subtask_count_ceiling: 10,
            })
            .await
            .unwrap();
        assert_eq!(response.subtasks.len(), 2);
        assert_eq!(response.subtasks[1].depends_on, vec![0]);
    }
}
