use crate::emitter::EVENT_CHANNEL_CAPACITY;
use crate::ratelimit::{Decision, RateLimiter};
use crate::workflow::{run_workflow, ResearchRequest, WorkflowDeps};
use answerpipe_core::WorkflowEvent;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone)]
pub struct AppState {
    pub deps: WorkflowDeps,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/research", post(research))
        .with_state(state)
}

fn event_frame(ev: &WorkflowEvent) -> Event {
    match serde_json::to_string(ev) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize workflow event");
            Event::default()
                .data(r#"{"type":"error","message":"event serialization failed"}"#)
        }
    }
}

/// One request, one workflow, one SSE stream. The bounded channel between the
/// workflow task and this response body is the cancellation boundary: when
/// the client goes away the body is dropped, the receiver closes, and the
/// workflow observes it on its next send.
async fn research(State(state): State<AppState>, Json(req): Json<ResearchRequest>) -> Response {
    let client_key = req
        .session_id
        .clone()
        .unwrap_or_else(|| req.chat_id.clone());

    match state.limiter.check_and_record("research", &client_key) {
        Decision::Denied { reset_at_ms } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "rate limited",
                "resetAt": reset_at_ms,
            })),
        )
            .into_response(),
        Decision::Allowed => {
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            tokio::spawn(run_workflow(state.deps.clone(), req, tx));
            let stream =
                ReceiverStream::new(rx).map(|ev| Ok::<_, Infallible>(event_frame(&ev)));
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
    }
}
