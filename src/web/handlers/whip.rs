//! WHIP ingress: `POST /api/ingress/whip`

use std::sync::Arc;

use axum::{body::Bytes, extract::State, response::Response};
use parking_lot::Mutex;
use tracing::Instrument;
use uuid::Uuid;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::sdp_created;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{answer_offer, read_offer};

/// Add receive-only audio and video transceivers
pub(crate) async fn add_recvonly_transceivers(pc: &RTCPeerConnection) -> Result<()> {
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| AppError::PeerConnection(format!("Failed to add {:?} transceiver: {}", kind, e)))?;
    }
    Ok(())
}

pub async fn whip_ingress(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let offer = read_offer(&body)?;
    let session_id = Uuid::new_v4();

    async move {
        tracing::info!("WHIP offer received");
        let pc = state.api.new_peer_connection().await?;
        match ingest(&state, &pc, offer).await {
            Ok(answer) => {
                tracing::info!("WHIP session established");
                Ok(sdp_created(answer))
            }
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    tracing::debug!("Failed to close peer connection: {}", close_err);
                }
                Err(e)
            }
        }
    }
    .instrument(tracing::info_span!("whip", session = %session_id))
    .await
}

/// Holds tracks that arrive before the stream exists, then hands them over
struct TrackBridge<T> {
    inner: Mutex<BridgeState<T>>,
}

struct BridgeState<T> {
    handler: Option<Arc<dyn Fn(T) + Send + Sync>>,
    early: Vec<T>,
}

impl<T> TrackBridge<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BridgeState {
                handler: None,
                early: Vec::new(),
            }),
        }
    }

    fn on_track(&self, track: T) {
        let handler = {
            let mut state = self.inner.lock();
            match &state.handler {
                Some(handler) => handler.clone(),
                None => {
                    state.early.push(track);
                    return;
                }
            }
        };
        handler(track);
    }

    fn attach(&self, handler: Arc<dyn Fn(T) + Send + Sync>) {
        let early = {
            let mut state = self.inner.lock();
            state.handler = Some(handler.clone());
            std::mem::take(&mut state.early)
        };
        for track in early {
            handler(track);
        }
    }
}

/// Negotiate first, then take over the stream slot.
///
/// A failed negotiation leaves the current stream alone; only an answered
/// offer supersedes it.
async fn ingest(state: &AppState, pc: &Arc<RTCPeerConnection>, offer: String) -> Result<String> {
    add_recvonly_transceivers(pc).await?;

    let peer_gone = state.shutdown.token().child_token();
    {
        let peer_gone = peer_gone.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            tracing::info!("ICE connection state: {:?}", s);
            if matches!(
                s,
                RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed
            ) {
                peer_gone.cancel();
            }
            Box::pin(async {})
        }));
    }

    let bridge: Arc<TrackBridge<Arc<TrackRemote>>> = Arc::new(TrackBridge::new());
    {
        let bridge = bridge.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            bridge.on_track(track);
            Box::pin(async {})
        }));
    }

    let answer = answer_offer(pc, offer, state.api.gather_timeout()).await?;
    if peer_gone.is_cancelled() {
        return Err(AppError::PeerConnection(
            "Publisher disconnected during negotiation".to_string(),
        ));
    }

    // The session token is a child of `peer_gone`, so ICE loss ends it
    let session = state.streams.handle_webrtc(&peer_gone)?;
    bridge.attach(session.on_track.clone());

    // The peer connection lives as long as the session
    {
        let pc = pc.clone();
        let cancel = session.cancel.clone();
        let stream_id = session.stream_id;
        tokio::spawn(async move {
            cancel.cancelled().await;
            tracing::info!("[{}] Closing publisher peer connection", stream_id);
            if let Err(e) = pc.close().await {
                tracing::debug!("[{}] Failed to close peer connection: {}", stream_id, e);
            }
        });
    }

    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn Fn(u32) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            Arc::new(move |track: u32| seen.lock().push(track)) as Arc<dyn Fn(u32) + Send + Sync>
        };
        (seen, handler)
    }

    #[test]
    fn test_bridge_replays_early_tracks_on_attach() {
        let bridge = TrackBridge::new();
        bridge.on_track(1);
        bridge.on_track(2);

        let (seen, handler) = recorder();
        bridge.attach(handler);
        assert_eq!(*seen.lock(), vec![1, 2]);

        // Later tracks go straight through
        bridge.on_track(3);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(bridge.inner.lock().early.is_empty());
    }

    #[test]
    fn test_bridge_without_handler_only_buffers() {
        let bridge = TrackBridge::new();
        bridge.on_track(7);
        assert_eq!(bridge.inner.lock().early, vec![7]);
    }
}
