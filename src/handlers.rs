use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{
        header::{CONNECTION, CONTENT_TYPE},
        Version,
    },
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, info};

use crate::{
    errors::AppError,
    models::{WizardRequest, WizardStage},
    session::SessionRecord,
    state::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn wizard_stream(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    version: Version,
    Json(request): Json<WizardRequest>,
) -> Response {
    let started = Instant::now();
    let stage_label = WizardStage::parse(&stage)
        .map(|stage| stage.as_str())
        .unwrap_or("unknown");

    let mut response = match process_wizard_stream(state.clone(), &stage, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };
    // connection-specific headers are illegal on HTTP/2 and later
    if version >= Version::HTTP_2 {
        response.headers_mut().remove(CONNECTION);
    }

    state.metrics.observe_request(
        stage_label,
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn process_wizard_stream(
    state: AppState,
    stage: &str,
    request: WizardRequest,
) -> Result<Response, AppError> {
    let stage = WizardStage::parse(stage)
        .ok_or_else(|| AppError::NotFound(format!("unknown wizard stage: {stage}")))?;
    let request = request
        .into_stream_request(stage, &state.config.validation)
        .map_err(AppError::Validation)?;

    info!(
        request_id = %request.request_id(),
        stage = stage.as_str(),
        session = request.session_token().unwrap_or_default(),
        upstream = state.relay.upstream_name(),
        "wizard stream accepted"
    );

    let descriptor = state.config.descriptor_for(stage);
    let handle = state.relay.relay(request, &descriptor).await?;

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let Ok(summary) = handle.summary.await else {
            return;
        };
        debug!(
            request_id = %summary.request_id,
            outcome = summary.outcome.label(),
            "recording relay summary"
        );
        sessions.record(&summary).await;
    });

    Ok(handle.response)
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, AppError> {
    state
        .sessions
        .get(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("session not found: {session_id}")))
}
