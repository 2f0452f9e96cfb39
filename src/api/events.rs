//! Outbound completion event stream — spec.md §6's `GET /tasks/:id/events`.
//!
//! Subscribes to the bus topic the engine publishes task-progress and
//! terminal events on and re-encodes each envelope as a Server-Sent Event
//! frame by hand over a `bytes`-backed byte stream, the same shape the
//! teacher's `llm/sse.rs` uses for streaming provider responses, just in the
//! outbound direction.

use std::convert::Infallible;

use axum::body::StreamBody;
use axum::extract::{Path, Query};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::models::task::TaskId;
use crate::OrchestratorError;

use super::ApiState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Last `sequence` the caller saw, per spec.md §6's cursor-based resend.
    /// Sequence numbers are monotonic per topic (`MessageBus::publish`), so
    /// unlike the envelope's `id` (a random UUID) this is actually orderable.
    #[serde(default)]
    pub cursor: Option<u64>,
}

/// Streams `{task_id, phase, status, payload?, timestamp}` frames as they're
/// published to the task's topic. Listeners reconnecting with a `cursor`
/// only see events published after it; there's no replay of events emitted
/// before the subscription started beyond what the broadcast channel's own
/// lagged-receiver buffer retains.
pub async fn stream_events(
    State(state): State<ApiState>,
    Path(task_id): Path<uuid::Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let task_id = TaskId(task_id);
    // Confirm the task exists before subscribing, so unknown IDs 404 instead
    // of opening a stream that will never emit anything.
    state.engine.get_status_by_task(task_id)?;

    let topic = format!("task:{task_id}");
    let receiver = state.engine.bus().subscribe(&topic);
    let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(envelope) => {
            if let Some(cursor) = query.cursor {
                if envelope.sequence <= cursor {
                    return None;
                }
            }
            let frame = format!("data: {}\n\n", envelope.payload);
            Some(Ok::<Bytes, Infallible>(Bytes::from(frame)))
        }
        Err(_lagged) => None,
    });

    Ok(StreamBody::new(stream))
}
