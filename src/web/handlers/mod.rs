pub mod hls;
pub mod legacy;
pub mod whep;
pub mod whip;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::state::AppState;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const NO_CACHE: &str = "no-cache, no-store, private";

/// 201 Created carrying an SDP answer
pub(crate) fn sdp_created(answer: String) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, SDP_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        answer,
    )
        .into_response()
}

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub broadcaster_id: Option<String>,
    pub active_stream: bool,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        broadcaster_id: state.broadcaster_id.clone(),
        active_stream: state.streams.has_active_stream(),
    })
}
