//! WHEP egress: `POST /api/egress/whep`

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::sdp_created;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{answer_offer, read_offer};

pub async fn whep_options() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn whep_egress(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let offer = read_offer(&body)?;
    let pc = state.api.new_peer_connection().await?;

    match subscribe(&state, &pc, offer).await {
        Ok(answer) => Ok(sdp_created(answer)),
        Err(e) => {
            if let Err(close_err) = pc.close().await {
                tracing::debug!("Failed to close subscriber peer connection: {}", close_err);
            }
            Err(e)
        }
    }
}

async fn subscribe(state: &AppState, pc: &Arc<RTCPeerConnection>, offer: String) -> Result<String> {
    let stream = state
        .streams
        .get_stateful_stream()
        .ok_or(AppError::NoActiveStream)?;
    let webrtc = stream.as_webrtc().ok_or(AppError::NoActiveStream)?;

    let tracks = webrtc.local_tracks();
    if tracks.is_empty() {
        return Err(AppError::NoActiveStream);
    }

    for track in tracks {
        let sender = pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::PeerConnection(format!("Failed to add track: {}", e)))?;
        // RTCP must be read for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
    }

    let gone = CancellationToken::new();
    {
        let gone = gone.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::debug!("WHEP subscriber state: {:?}", s);
            if matches!(
                s,
                RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            ) {
                gone.cancel();
            }
            Box::pin(async {})
        }));
    }
    {
        let pc = pc.clone();
        let upstream = webrtc.closed_token();
        let stream_id = stream.id();
        tokio::spawn(async move {
            tokio::select! {
                _ = upstream.cancelled() => {
                    tracing::info!("[{}] Stream ended, closing subscriber", stream_id);
                }
                _ = gone.cancelled() => {
                    tracing::info!("[{}] Subscriber left", stream_id);
                }
            }
            if let Err(e) = pc.close().await {
                tracing::debug!("[{}] Failed to close subscriber: {}", stream_id, e);
            }
        });
    }

    answer_offer(pc, offer, state.api.gather_timeout()).await
}
