//! Legacy WHIP: `POST /api/consumer/whip`, driven by the orchestrator

use std::sync::Arc;

use axum::{body::Bytes, extract::State, response::Response};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use super::sdp_created;
use super::whip::add_recvonly_transceivers;
use crate::error::Result;
use crate::orchestrator::WhipControl;
use crate::processor::{FfmpegHlsProcessor, MediaProcessor};
use crate::state::AppState;
use crate::webrtc::{answer_offer, read_offer};

pub async fn consumer_whip(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let offer = read_offer(&body)?;
    let pc = state.api.new_peer_connection().await?;

    match orchestrate(&state, &pc, offer).await {
        Ok(answer) => Ok(sdp_created(answer)),
        Err(e) => {
            if let Err(close_err) = pc.close().await {
                tracing::debug!("Failed to close peer connection: {}", close_err);
            }
            Err(e)
        }
    }
}

async fn orchestrate(state: &AppState, pc: &Arc<RTCPeerConnection>, offer: String) -> Result<String> {
    let orchestrator = &state.orchestrator;
    add_recvonly_transceivers(pc).await?;

    let processor: Arc<dyn MediaProcessor> =
        Arc::new(FfmpegHlsProcessor::new(state.hls_settings.clone()));
    let control = WhipControl::new(pc.clone(), vec![processor], orchestrator.shutdown().token());
    orchestrator.register_control(Arc::new(control))?;

    let weak = Arc::downgrade(orchestrator);
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        tracing::info!("Legacy WHIP ICE connection state: {:?}", s);
        if s == RTCIceConnectionState::Disconnected {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.stop();
            }
        }
        Box::pin(async {})
    }));

    orchestrator.start()?;

    {
        let pc = pc.clone();
        orchestrator.shutdown().add_task(move || {
            tokio::spawn(async move {
                if let Err(e) = pc.close().await {
                    tracing::debug!("Failed to close legacy peer connection: {}", e);
                }
            });
        });
    }

    match answer_offer(pc, offer, state.api.gather_timeout()).await {
        Ok(answer) => Ok(answer),
        Err(e) => {
            orchestrator.stop();
            Err(e)
        }
    }
}
