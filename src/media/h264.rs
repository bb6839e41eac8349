//! H.264 RTP to Annex-B elementary stream

use async_trait::async_trait;
use rtp::codecs::h264::H264Packet;
use rtp::packetizer::Depacketizer;

use super::rtp_track::parse_rtp;
use super::{MediaError, MediaWriter, Result};
use crate::pipe::PipeWriter;

const NALU_TYPE_MASK: u8 = 0x1F;
const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_STAP_A: u8 = 24;

/// Whether an RTP payload starts a decodable sequence (carries an SPS)
pub fn is_keyframe(payload: &[u8]) -> bool {
    match payload.first().map(|b| b & NALU_TYPE_MASK) {
        Some(NALU_TYPE_SPS) => true,
        // STAP-A: 1 byte header, 2 byte size, then the first aggregated NAL
        Some(NALU_TYPE_STAP_A) => payload
            .get(3)
            .is_some_and(|b| b & NALU_TYPE_MASK == NALU_TYPE_SPS),
        _ => false,
    }
}

/// Depacketizes H.264 RTP into an Annex-B byte stream.
///
/// Output starts at the first packet carrying an SPS; everything before it is
/// skipped because a decoder could not use it.
pub struct RtpToH264MediaWriter {
    target: PipeWriter,
    depacketizer: H264Packet,
    has_keyframe: bool,
}

impl RtpToH264MediaWriter {
    pub fn new(target: PipeWriter) -> Self {
        Self {
            target,
            depacketizer: H264Packet::default(),
            has_keyframe: false,
        }
    }
}

#[async_trait]
impl MediaWriter for RtpToH264MediaWriter {
    async fn write(&mut self, packet: &[u8]) -> Result<usize> {
        let rtp = parse_rtp(packet)?;
        if rtp.payload.is_empty() {
            return Ok(0);
        }

        if !self.has_keyframe {
            if !is_keyframe(&rtp.payload) {
                return Ok(0);
            }
            tracing::debug!("H264 keyframe received, starting Annex-B output");
            self.has_keyframe = true;
        }

        let annexb = self
            .depacketizer
            .depacketize(&rtp.payload)
            .map_err(|e| MediaError::Depacketize(e.to_string()))?;
        if annexb.is_empty() {
            // Middle of a fragmented NAL
            return Ok(packet.len());
        }

        self.target
            .write(annexb)
            .await
            .map_err(|_| MediaError::PipeClosed)?;
        Ok(packet.len())
    }
}
