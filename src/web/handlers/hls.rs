//! HLS egress: manifest and segments of the registered processor

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use super::NO_CACHE;
use crate::error::{AppError, Result};
use crate::processor::HlsOutput;
use crate::state::AppState;

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "application/octet-stream";

/// Segment names are single path components inside the output directory
pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0')
    {
        return Err(AppError::BadRequest(format!("Invalid segment name {:?}", segment)));
    }
    Ok(())
}

fn current_output(state: &AppState) -> Result<HlsOutput> {
    if !state.hls_router.is_active() {
        return Err(AppError::NotFound("No HLS stream".to_string()));
    }
    state
        .hls_router
        .output()
        .ok_or_else(|| AppError::NotFound("HLS output not ready".to_string()))
}

pub async fn hls_manifest(State(state): State<Arc<AppState>>) -> Result<Response> {
    let output = current_output(&state)?;
    let manifest = tokio::fs::read(&output.manifest)
        .await
        .map_err(|e| AppError::NotFound(format!("Manifest {}: {}", output.manifest.display(), e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        manifest,
    )
        .into_response())
}

pub async fn hls_segment(
    State(state): State<Arc<AppState>>,
    Path(segment): Path<String>,
) -> Result<Response> {
    validate_segment(&segment)?;
    let output = current_output(&state)?;

    let path = output.dir.join(&segment);
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::NotFound(format!("Segment {}: {}", path.display(), e)))?;

    Ok((
        [
            (header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
