//! Thin inbound/outbound HTTP surface — spec.md §6.
//!
//! Handlers hold no business logic; they translate JSON to engine calls and
//! back, matching the teacher's `api/handlers.rs` pattern of thin handlers
//! delegating to state held in an `Arc`.

mod events;
mod handlers;
mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::engine::WorkflowEngine;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<WorkflowEngine>,
}

pub fn router(engine: Arc<WorkflowEngine>) -> Router {
    let state = ApiState { engine };
    Router::new()
        .route("/tasks", post(handlers::submit_task))
        .route("/tasks/:id", get(handlers::get_status))
        .route("/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/tasks/:id/events", get(events::stream_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
