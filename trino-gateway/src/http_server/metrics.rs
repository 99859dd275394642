use std::sync::Arc;

use axum::extract::State;
use http::StatusCode;
use prometheus::TextEncoder;
use tracing::{error, instrument};

use crate::http_server::AppState;

#[instrument(name = "GET /metrics", skip(state))]
pub async fn get(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&state.metrics.registry.gather())
        .map_err(|err| {
            error!(?err, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
