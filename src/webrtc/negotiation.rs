//! Offer/answer exchange with a complete (non-trickled) answer

use std::time::Duration;

use bytes::Bytes;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{AppError, Result};

/// SDP offer from a WHIP/WHEP request body
pub fn read_offer(body: &Bytes) -> Result<String> {
    let sdp = std::str::from_utf8(body)
        .map_err(|e| AppError::BadOffer(format!("Offer is not UTF-8: {}", e)))?;
    if sdp.trim().is_empty() {
        return Err(AppError::BadOffer("Empty offer".to_string()));
    }
    Ok(sdp.to_string())
}

/// Apply `offer` and return the local answer once ICE gathering is done.
///
/// Gathering is bounded by `gather_timeout`; on timeout the answer carries the
/// candidates gathered so far.
pub async fn answer_offer(
    pc: &RTCPeerConnection,
    offer: String,
    gather_timeout: Duration,
) -> Result<String> {
    let offer = RTCSessionDescription::offer(offer)
        .map_err(|e| AppError::BadOffer(format!("Invalid SDP offer: {}", e)))?;
    pc.set_remote_description(offer)
        .await
        .map_err(|e| AppError::BadOffer(format!("Failed to set remote description: {}", e)))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))?;

    if tokio::time::timeout(gather_timeout, gather_complete.recv())
        .await
        .is_err()
    {
        tracing::warn!(
            "ICE gathering not complete after {:?}, answering with partial candidates",
            gather_timeout
        );
    }

    pc.local_description()
        .await
        .map(|description| description.sdp)
        .ok_or_else(|| AppError::Negotiation("No local description after answer".to_string()))
}
