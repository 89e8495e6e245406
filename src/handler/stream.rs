use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;

use crate::{
    handler::AppState,
    pipeline::{PipelineState, StartOutcome, stats::StatsSnapshot},
};

pub fn stream_router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
}

#[derive(Debug, Serialize)]
struct StreamResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StreamResponse {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: PipelineState,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

async fn start(State(app): State<AppState>) -> Json<StreamResponse> {
    let response = match app.controller.start().await {
        StartOutcome::Started => StreamResponse::status("started"),
        StartOutcome::AlreadyStreaming => StreamResponse::status("already streaming"),
        StartOutcome::Failed(error) => StreamResponse {
            status: "failed",
            error: Some(error),
        },
    };
    Json(response)
}

async fn stop(State(app): State<AppState>) -> Json<StreamResponse> {
    app.controller.stop().await;
    Json(StreamResponse::status("stopped"))
}

async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: app.controller.state(),
        stats: app.controller.stats(),
    })
}
