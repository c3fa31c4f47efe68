pub mod config;
pub mod decoder;
pub mod errors;
pub mod frame;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod session;
pub mod state;
pub mod upstream;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use config::RelayConfig;
use tracing::info;
use upstream::{http::HttpUpstream, mock::MockUpstream};

pub fn build_state() -> Result<state::AppState, std::io::Error> {
    let config = RelayConfig::from_env();

    let state = if config.uses_mock_upstream() {
        info!("RELAY_UPSTREAM_URL not set, relaying to the built-in mock upstream");
        state::AppState::new(config, Arc::new(MockUpstream::default()))
    } else {
        let upstream = HttpUpstream::new(&config.upstream).map_err(std::io::Error::other)?;
        state::AppState::new(config, Arc::new(upstream))
    };

    info!(
        upstream = state.relay.upstream_name(),
        base_url = state.config.upstream.base_url.as_deref().unwrap_or("mock"),
        session_store = state.sessions.kind(),
        stages = state.config.stages.len(),
        "stream relay configured"
    );
    Ok(state)
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/wizard/:stage/stream", post(handlers::wizard_stream))
        .route("/api/sessions/:session_id", get(handlers::get_session))
        .with_state(state)
}
